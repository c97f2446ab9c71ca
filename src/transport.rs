//! The transport binding is the seam between the session state machine and the network. It
//!  exposes ENet-style primitives: a process-wide init / deinit pair, hosts (a bound UDP socket
//!  with a fixed number of peer slots and channels), peers (remote endpoints reachable through a
//!  host), and an event pump that is serviced with a bounded timeout.
//!
//! Handles returned by the binding are generation-checked: using a peer handle after its
//!  peer was disconnected, or a host handle after its host was destroyed, is reported as
//!  [TransportError::UnknownPeer] / [TransportError::UnknownHost] rather than touching
//!  whatever now occupies the slot.

pub mod backoff;
pub mod handles;
pub mod reliable_udp;

use std::fmt::{Display, Formatter};
use std::time::Duration;
use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

pub use handles::{HostHandle, PeerHandle};

/// An unresolved address as supplied by the application, e.g. `localhost:2330`. Resolution is
///  the binding's job.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct HostAddress {
    pub host: String,
    pub port: u16,
}

impl HostAddress {
    pub fn new(host: impl Into<String>, port: u16) -> HostAddress {
        HostAddress {
            host: host.into(),
            port,
        }
    }
}

impl Display for HostAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

bitflags! {
    /// Delivery flags for a single packet. The empty set means 'unreliable, sequenced': the
    ///  packet may get lost, and it is dropped if a newer unreliable packet on the same channel
    ///  was delivered already.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
    pub struct PacketFlags: u8 {
        /// acknowledged, retransmitted and delivered in order with other reliable packets of
        ///  the same channel
        const RELIABLE = 0b0000_0001;
        /// delivered as it arrives, without regard to ordering
        const UNSEQUENCED = 0b0000_0010;
    }
}

/// Raw events produced by servicing a host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransportEvent {
    /// A connection was established: an inbound CONNECT was accepted (server side, `data` holds
    ///  the peer's connect data), or our CONNECT was accepted (client side, `data` is empty).
    Connect { peer: PeerHandle, data: Bytes },
    /// A previously connected peer went away, either gracefully or by timing out. The handle is
    ///  stale once this event is returned.
    Disconnect { peer: PeerHandle },
    Receive { peer: PeerHandle, channel: u8, data: Bytes },
    /// An outbound connect request never completed: it was refused, timed out, or was
    ///  cancelled locally. The peer never counted as connected.
    ConnectFailed { peer: PeerHandle },
}

impl TransportEvent {
    pub fn peer(&self) -> PeerHandle {
        match self {
            TransportEvent::Connect { peer, .. } => *peer,
            TransportEvent::Disconnect { peer } => *peer,
            TransportEvent::Receive { peer, .. } => *peer,
            TransportEvent::ConnectFailed { peer } => *peer,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is already initialized")]
    AlreadyInitialized,
    #[error("transport is not initialized")]
    NotInitialized,
    #[error("unknown or destroyed host {0}")]
    UnknownHost(HostHandle),
    #[error("unknown or disconnected peer {0}")]
    UnknownPeer(PeerHandle),
    #[error("peer {0} has not completed its connection handshake")]
    NotConnected(PeerHandle),
    #[error("channel {channel} is out of range, the connection has {channel_count} channels")]
    InvalidChannel { channel: u8, channel_count: u8 },
    #[error("invalid channel count {0}")]
    InvalidChannelCount(u8),
    #[error("payload of {len} bytes exceeds the limit of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("all {0} peer slots are in use")]
    NoFreePeerSlot(usize),
    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),
    #[error("could not resolve {0}")]
    Resolve(HostAddress),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Primitives of a reliable UDP library, reduced to what a single-role session needs.
///
/// Methods that may wait (name resolution, socket binding, servicing) are async; everything
///  else returns immediately. Sends never block: datagrams that can not be handed to the OS
///  right away are treated as lost, which reliable delivery recovers from.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportBinding: Send + 'static {
    /// process-wide start; must precede everything else
    fn initialize(&mut self) -> Result<(), TransportError>;

    /// Destroys all remaining hosts and returns to the uninitialized state. Calling this when
    ///  not initialized does nothing.
    fn deinitialize(&mut self);

    /// Creates a host bound to `bind_addr`, or to an ephemeral port if `None`.
    async fn create_host(&mut self, bind_addr: Option<HostAddress>, max_peers: usize, channel_count: u8) -> Result<HostHandle, TransportError>;

    /// Best-effort notifies connected peers and releases the host. Unknown handles are ignored.
    fn destroy_host(&mut self, host: HostHandle);

    /// Initiates an asynchronous connection. Success is reported by a later
    ///  [TransportEvent::Connect] for the returned peer, failure by [TransportEvent::ConnectFailed].
    ///
    /// A `channel_count` of 0 requests the host's channel count.
    async fn connect(&mut self, host: HostHandle, address: HostAddress, channel_count: u8, connect_data: Bytes) -> Result<PeerHandle, TransportError>;

    /// Requests a graceful disconnect. Completion is reported by a later event.
    fn disconnect(&mut self, peer: PeerHandle) -> Result<(), TransportError>;

    fn send(&mut self, peer: PeerHandle, data: Bytes, channel: u8, flags: PacketFlags) -> Result<(), TransportError>;

    /// Returns the next event, waiting up to `timeout` for one to occur. `None` means that the
    ///  timeout elapsed without any event.
    async fn service(&mut self, host: HostHandle, timeout: Duration) -> Result<Option<TransportEvent>, TransportError>;

    fn local_addr(&self, host: HostHandle) -> Result<std::net::SocketAddr, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_address_display() {
        assert_eq!(HostAddress::new("localhost", 2330).to_string(), "localhost:2330");
    }

    #[test]
    fn test_default_flags_are_unreliable() {
        assert!(!PacketFlags::default().contains(PacketFlags::RELIABLE));
        assert!(PacketFlags::empty().is_empty());
    }
}
