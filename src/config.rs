use std::time::Duration;
use anyhow::bail;

/// Tuning parameters of the reliable UDP binding. The defaults are chosen for game-style
///  traffic on a LAN or the public internet: small datagrams, aggressive retransmission, and
///  a few seconds of silence before a peer is considered gone.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Maximum size of an application payload in a single DATA datagram. There is no
    ///  fragmentation, so sending a bigger payload fails.
    ///
    /// The default leaves room for the packet header inside a 1280 byte IPV6 minimum MTU.
    pub max_payload_size: usize,

    /// Delay before the first retransmit of a reliable packet or a CONNECT / DISCONNECT request.
    ///  Subsequent retransmits back off exponentially up to `retransmit_max`.
    pub retransmit_initial: Duration,
    pub retransmit_max: Duration,
    /// Number of retransmits after which a peer is considered unreachable
    pub max_retransmits: u32,

    /// An idle connected peer is sent a PING after this interval to keep the connection alive
    pub ping_interval: Duration,
    /// A connected peer from which nothing was received for this long is disconnected
    pub peer_timeout: Duration,

    /// Granularity of housekeeping (retransmits, pings, timeouts) while a host is serviced
    pub tick_interval: Duration,

    /// Number of out-of-order reliable packets per channel that are held back waiting for
    ///  a gap to be filled. Packets further ahead are dropped and retransmitted by the sender.
    pub receive_window: u32,

    /// Upper bound for the data sent along with a CONNECT request (e.g. a client identity)
    pub max_connect_data: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            max_payload_size: 1200,
            retransmit_initial: Duration::from_millis(100),
            retransmit_max: Duration::from_secs(2),
            max_retransmits: 8,
            ping_interval: Duration::from_millis(500),
            peer_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_millis(20),
            receive_window: 256,
            max_connect_data: 255,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_payload_size < 16 {
            bail!("max payload size is too small");
        }
        if self.max_payload_size > 65_000 {
            bail!("max payload size {} does not fit a UDP datagram", self.max_payload_size);
        }
        if self.retransmit_initial.is_zero() {
            bail!("initial retransmit interval must be positive");
        }
        if self.retransmit_max < self.retransmit_initial {
            bail!("max retransmit interval must not be smaller than the initial interval");
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must be positive");
        }
        if self.peer_timeout <= self.ping_interval {
            bail!("peer timeout must be longer than the ping interval");
        }
        if self.receive_window == 0 {
            bail!("receive window must hold at least one packet");
        }
        if self.max_connect_data > u8::MAX as usize {
            bail!("connect data is limited to {} bytes", u8::MAX);
        }
        Ok(())
    }
}

/// Configuration of a [crate::session::Session] and the endpoint descriptors driving it.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// bounded wait used by the endpoints' `poll()`
    pub poll_timeout: Duration,
    pub client_channels: u32,
    pub server_channels: u32,
    pub max_clients: u32,

    pub transport: TransportConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig::new()
    }
}

impl SessionConfig {
    pub fn new() -> SessionConfig {
        SessionConfig {
            poll_timeout: Duration::from_millis(600),
            client_channels: 1,
            server_channels: 1,
            max_clients: 32,
            transport: TransportConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.client_channels == 0 || self.client_channels > u8::MAX as u32 {
            bail!("client channel count must be between 1 and {}", u8::MAX);
        }
        if self.server_channels == 0 || self.server_channels > u8::MAX as u32 {
            bail!("server channel count must be between 1 and {}", u8::MAX);
        }
        if self.max_clients == 0 {
            bail!("a server must accept at least one client");
        }
        self.transport.validate()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        SessionConfig::new().validate().unwrap();
    }

    #[test]
    fn test_default_poll_timeout() {
        assert_eq!(SessionConfig::default().poll_timeout, Duration::from_millis(600));
        assert_eq!(SessionConfig::default().max_clients, 32);
    }

    #[rstest]
    #[case::payload_too_small(|c: &mut TransportConfig| c.max_payload_size = 8)]
    #[case::payload_too_big(|c: &mut TransportConfig| c.max_payload_size = 70_000)]
    #[case::zero_retransmit(|c: &mut TransportConfig| c.retransmit_initial = Duration::ZERO)]
    #[case::max_below_initial(|c: &mut TransportConfig| c.retransmit_max = Duration::from_millis(10))]
    #[case::zero_tick(|c: &mut TransportConfig| c.tick_interval = Duration::ZERO)]
    #[case::timeout_below_ping(|c: &mut TransportConfig| c.peer_timeout = Duration::from_millis(100))]
    #[case::zero_window(|c: &mut TransportConfig| c.receive_window = 0)]
    #[case::connect_data_too_big(|c: &mut TransportConfig| c.max_connect_data = 300)]
    fn test_invalid_transport_config(#[case] patch: fn(&mut TransportConfig)) {
        let mut config = TransportConfig::default();
        patch(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::no_client_channels(0, 1, 32)]
    #[case::too_many_client_channels(256, 1, 32)]
    #[case::no_server_channels(1, 0, 32)]
    #[case::no_clients(1, 1, 0)]
    fn test_invalid_session_config(#[case] client_channels: u32, #[case] server_channels: u32, #[case] max_clients: u32) {
        let mut config = SessionConfig::new();
        config.client_channels = client_channels;
        config.server_channels = server_channels;
        config.max_clients = max_clients;
        assert!(config.validate().is_err());
    }
}
