use std::fmt::{Debug, Formatter};
use bytes::Bytes;
use crate::transport::PeerHandle;

/// Correlates the outcome of an asynchronous connect or disconnect with the request that
///  started it. Tokens increase monotonically per session.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RequestToken(u64);

impl RequestToken {
    pub fn from_raw(value: u64) -> RequestToken {
        RequestToken(value)
    }
}

impl Debug for RequestToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Returned by a connect request. The connection exists only once an [Event::Connect] for
///  `peer` was dispatched.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ConnectRequest {
    pub peer: PeerHandle,
    pub token: RequestToken,
}

/// A transport event after the session applied it to its own state, as it is handed to the
///  listener.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// `data` is the connect data sent by the client (server side), or empty (client side).
    ///  `request` is set if the connection was initiated locally.
    Connect { peer: PeerHandle, data: Bytes, request: Option<RequestToken> },
    /// `request` is set if the disconnect was requested locally
    Disconnect { peer: PeerHandle, request: Option<RequestToken> },
    Receive { peer: PeerHandle, channel: u8, data: Bytes },
    /// a locally initiated connect did not succeed
    ConnectFailed { peer: PeerHandle, request: Option<RequestToken> },
}

impl Event {
    pub fn peer(&self) -> PeerHandle {
        match self {
            Event::Connect { peer, .. } => *peer,
            Event::Disconnect { peer, .. } => *peer,
            Event::Receive { peer, .. } => *peer,
            Event::ConnectFailed { peer, .. } => *peer,
        }
    }
}
