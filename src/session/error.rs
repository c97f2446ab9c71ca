use tracing::{error, warn};
use crate::transport::{PeerHandle, TransportError};

/// The two kinds of failure a session operation can report.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// The session was driven out of its valid sequence, or got an argument that can never
    ///  work. Retrying the same call is pointless: the calling code needs fixing.
    CallerBug,
    /// The network or the OS refused. The session state is unchanged, and the caller may
    ///  retry.
    Environment,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is already initialized")]
    AlreadyInitialized,
    #[error("session is not initialized")]
    NotInitialized,
    #[error("a host exists already - shut down first")]
    HostAlreadyExists,
    #[error("no host was created")]
    NoHost,
    #[error("operation requires a client host")]
    NotAClientHost,
    #[error("operation requires a server host")]
    NotAServerHost,
    #[error("not connected")]
    NotConnected,
    #[error("{0} is not a connected peer")]
    UnknownPeer(PeerHandle),
    #[error("no listener is installed")]
    NoListenerInstalled,
    #[error("{0} is not a valid UDP port")]
    InvalidPort(u32),
    #[error("channel count {0} is out of range")]
    InvalidChannelCount(u32),
    #[error("channel {channel} is out of range, the connection has {channel_count} channels")]
    InvalidChannel { channel: u8, channel_count: u8 },
    #[error("{len} bytes of connect data exceed the limit of {max}")]
    ConnectDataTooLarge { len: usize, max: usize },

    #[error("transport initialization failed: {0}")]
    TransportInitError(#[source] TransportError),
    #[error("host creation failed: {0}")]
    HostCreationFailed(#[source] TransportError),
    #[error("connect request failed: {0}")]
    ConnectRequestFailed(#[source] TransportError),
    #[error("disconnect request failed: {0}")]
    DisconnectFailed(#[source] TransportError),
    #[error("send failed: {0}")]
    SendFailed(#[source] TransportError),
    #[error("servicing the host failed: {0}")]
    PollFailed(#[source] TransportError),
}

impl SessionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SessionError::TransportInitError(_) |
            SessionError::HostCreationFailed(_) |
            SessionError::ConnectRequestFailed(_) |
            SessionError::DisconnectFailed(_) |
            SessionError::SendFailed(_) |
            SessionError::PollFailed(_) => ErrorClass::Environment,
            _ => ErrorClass::CallerBug,
        }
    }

    pub fn is_caller_bug(&self) -> bool {
        self.class() == ErrorClass::CallerBug
    }

    /// Logs the error where it is raised: caller bugs loudly, environment failures as warnings
    pub(crate) fn logged(self) -> SessionError {
        match self.class() {
            ErrorClass::CallerBug => error!("session used incorrectly: {}", self),
            ErrorClass::Environment => warn!("{}", self),
        }
        self
    }

    /// Maps a failed send, distinguishing addressing bugs from network trouble
    pub(crate) fn from_send(e: TransportError) -> SessionError {
        match e {
            TransportError::UnknownPeer(peer) => SessionError::UnknownPeer(peer),
            TransportError::NotConnected(_) => SessionError::NotConnected,
            TransportError::InvalidChannel { channel, channel_count } => SessionError::InvalidChannel { channel, channel_count },
            e => SessionError::SendFailed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use crate::transport::{HostHandle, PeerHandle, TransportError};
    use super::*;

    fn peer() -> PeerHandle {
        PeerHandle { host: HostHandle::from_raw(1), slot: 0, generation: 0 }
    }

    #[rstest]
    #[case::already_initialized(SessionError::AlreadyInitialized, ErrorClass::CallerBug)]
    #[case::no_host(SessionError::NoHost, ErrorClass::CallerBug)]
    #[case::no_listener(SessionError::NoListenerInstalled, ErrorClass::CallerBug)]
    #[case::unknown_peer(SessionError::UnknownPeer(peer()), ErrorClass::CallerBug)]
    #[case::invalid_port(SessionError::InvalidPort(70_000), ErrorClass::CallerBug)]
    #[case::connect_data(SessionError::ConnectDataTooLarge { len: 300, max: 255 }, ErrorClass::CallerBug)]
    #[case::disconnect(SessionError::DisconnectFailed(TransportError::UnknownHost(HostHandle::from_raw(1))), ErrorClass::Environment)]
    #[case::init(SessionError::TransportInitError(TransportError::AlreadyInitialized), ErrorClass::Environment)]
    #[case::host_creation(SessionError::HostCreationFailed(TransportError::NoFreePeerSlot(1)), ErrorClass::Environment)]
    #[case::poll(SessionError::PollFailed(TransportError::NotInitialized), ErrorClass::Environment)]
    fn test_class(#[case] error: SessionError, #[case] expected: ErrorClass) {
        assert_eq!(error.class(), expected);
        assert_eq!(error.is_caller_bug(), expected == ErrorClass::CallerBug);
    }

    #[rstest]
    #[case::unknown_peer(TransportError::UnknownPeer(peer()), true)]
    #[case::not_connected(TransportError::NotConnected(peer()), true)]
    #[case::invalid_channel(TransportError::InvalidChannel { channel: 3, channel_count: 1 }, true)]
    #[case::too_large(TransportError::PayloadTooLarge { len: 2000, max: 1200 }, false)]
    fn test_from_send(#[case] transport_error: TransportError, #[case] expect_caller_bug: bool) {
        assert_eq!(SessionError::from_send(transport_error).is_caller_bug(), expect_caller_bug);
    }
}
