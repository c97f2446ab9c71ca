//! Endpoint descriptors: immutable address / identity values that drive a [Session] through
//!  its lifecycle. A descriptor does not own the session, so the same descriptor can be used
//!  again after a failed `connect()`.

use bytes::Bytes;
use tracing::{info, warn};
use crate::packet::{send_packet, Packet};
use crate::session::{ConnectRequest, RequestToken, Session, SessionError};
use crate::transport::{PacketFlags, PeerHandle};

/// Channel and flags used by the descriptors' `send()`
const DEFAULT_CHANNEL: u8 = 0;

/// Undoes whatever a failed `connect()` set up, so the same or another descriptor can retry.
///  A session that was initialized before the call is left alone: the call failed without
///  touching it.
fn roll_back_on_failure<T>(session: &mut Session, was_initialized: bool, result: Result<T, SessionError>) -> Result<T, SessionError> {
    if let Err(e) = &result {
        if !was_initialized && session.is_initialized() {
            warn!("connect failed, resetting the session: {}", e);
            session.shutdown();
        }
    }
    result
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ClientEndpoint {
    address: String,
    port: u32,
    identity: String,
}

impl ClientEndpoint {
    pub fn new(address: impl Into<String>, port: u32, identity: impl Into<String>) -> ClientEndpoint {
        ClientEndpoint {
            address: address.into(),
            port,
            identity: identity.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// `address:port`
    pub fn ipaddress(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Initializes the session, creates a client host and requests a connection to the server,
    ///  sending the identity along. The connection is established once a Connect event is
    ///  polled.
    pub async fn connect(&self, session: &mut Session) -> Result<ConnectRequest, SessionError> {
        let was_initialized = session.is_initialized();
        let result = self.do_connect(session).await;
        roll_back_on_failure(session, was_initialized, result)
    }

    async fn do_connect(&self, session: &mut Session) -> Result<ConnectRequest, SessionError> {
        info!("connecting to {} as {}", self.ipaddress(), self.identity);
        session.initialize()?;
        let channels = session.config().client_channels;
        session.create_client(channels).await?;
        session.client_connect_with_data(&self.address, self.port, 0, Bytes::copy_from_slice(self.identity.as_bytes())).await
    }

    /// Polls for events with the session's configured poll timeout
    pub async fn poll(&self, session: &mut Session) -> Result<usize, SessionError> {
        let timeout = session.config().poll_timeout;
        session.poll(timeout).await
    }

    /// Sends a packet to the server on the default channel, unreliably
    pub fn send<P: Packet + ?Sized>(&self, session: &mut Session, packet: &P) -> Result<(), SessionError> {
        send_packet(session, None, packet, DEFAULT_CHANNEL, PacketFlags::empty())
    }

    pub fn disconnect(&self, session: &mut Session) -> Result<Option<RequestToken>, SessionError> {
        session.client_disconnect()
    }

    pub fn shutdown(&self, session: &mut Session) {
        session.shutdown();
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ServerEndpoint {
    address: String,
    port: u32,
}

impl ServerEndpoint {
    pub fn new(address: impl Into<String>, port: u32) -> ServerEndpoint {
        ServerEndpoint {
            address: address.into(),
            port,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn ipaddress(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Initializes the session and creates a server host bound to this endpoint's address
    pub async fn connect(&self, session: &mut Session) -> Result<(), SessionError> {
        let was_initialized = session.is_initialized();
        let result = self.do_connect(session).await;
        roll_back_on_failure(session, was_initialized, result)
    }

    async fn do_connect(&self, session: &mut Session) -> Result<(), SessionError> {
        info!("starting server on {}", self.ipaddress());
        session.initialize()?;
        let channels = session.config().server_channels;
        let max_clients = session.config().max_clients;
        session.create_server(&self.address, self.port, channels, max_clients).await
    }

    pub async fn poll(&self, session: &mut Session) -> Result<usize, SessionError> {
        let timeout = session.config().poll_timeout;
        session.poll(timeout).await
    }

    /// Sends a packet to a connected client on the default channel, unreliably
    pub fn send<P: Packet + ?Sized>(&self, session: &mut Session, peer: PeerHandle, packet: &P) -> Result<(), SessionError> {
        send_packet(session, Some(peer), packet, DEFAULT_CHANNEL, PacketFlags::empty())
    }

    /// Sends a packet to all connected clients, returning their number
    pub fn broadcast<P: Packet + ?Sized>(&self, session: &mut Session, packet: &P) -> Result<usize, SessionError> {
        session.broadcast(packet.to_bytes(), DEFAULT_CHANNEL, PacketFlags::empty())
    }

    pub fn shutdown(&self, session: &mut Session) {
        session.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use bytes::Bytes;
    use tokio::net::UdpSocket;
    use crate::config::SessionConfig;
    use crate::session::{ErrorClass, Event, Session, SessionError};
    use crate::test_util::listener::RecordingListener;
    use crate::transport::PacketFlags;
    use super::*;

    fn fast_config() -> SessionConfig {
        let mut config = SessionConfig::new();
        config.poll_timeout = Duration::from_millis(100);
        config
    }

    fn session_with_listener(config: SessionConfig) -> (Session, RecordingListener) {
        let mut session = Session::new(config);
        let listener = RecordingListener::new();
        session.install_listener(Box::new(listener.clone()));
        (session, listener)
    }

    async fn start_server() -> (ServerEndpoint, Session, RecordingListener, u32) {
        let server = ServerEndpoint::new("127.0.0.1", 0);
        let (mut session, listener) = session_with_listener(fast_config());
        server.connect(&mut session).await.unwrap();
        let port = session.local_addr().unwrap().port() as u32;
        (server, session, listener, port)
    }

    /// connects a client and polls both sides until the handshake completed
    async fn connect_client(server: &ServerEndpoint, server_session: &mut Session, port: u32, identity: &str) -> (ClientEndpoint, Session, RecordingListener) {
        let client = ClientEndpoint::new("127.0.0.1", port, identity);
        let (mut session, listener) = session_with_listener(fast_config());
        client.connect(&mut session).await.unwrap();

        for _ in 0..20 {
            server.poll(server_session).await.unwrap();
            client.poll(&mut session).await.unwrap();
            if session.is_connected() {
                return (client, session, listener);
            }
        }
        panic!("client {} did not connect", identity);
    }

    #[test]
    fn test_ipaddress() {
        assert_eq!(ClientEndpoint::new("localhost", 2330, "x").ipaddress(), "localhost:2330");
        assert_eq!(ServerEndpoint::new("0.0.0.0", 2330).ipaddress(), "0.0.0.0:2330");
    }

    #[test]
    fn test_descriptors_are_values() {
        let client = ClientEndpoint::new("localhost", 2330, "alice");
        let copy = client.clone();
        assert_eq!(client, copy);
        assert_eq!(copy.identity(), "alice");
        assert_eq!(copy.port(), 2330);
        assert_eq!(copy.address(), "localhost");
    }

    #[tokio::test]
    async fn test_connect_ping_scenario() {
        let server = ServerEndpoint::new("127.0.0.1", 2330);
        let (mut server_session, server_events) = session_with_listener(SessionConfig::new());
        server.connect(&mut server_session).await.unwrap();

        let client = ClientEndpoint::new("127.0.0.1", 2330, "alice");
        let (mut client_session, client_events) = session_with_listener(SessionConfig::new());
        let request = client.connect(&mut client_session).await.unwrap();

        server.poll(&mut server_session).await.unwrap();
        client.poll(&mut client_session).await.unwrap();

        assert_eq!(server_events.num_connects(), 1);
        match &server_events.events()[0] {
            Event::Connect { data, request, .. } => {
                assert_eq!(data, &Bytes::from_static(b"alice"));
                assert_eq!(*request, None);
            }
            evt => panic!("unexpected event {:?}", evt),
        }
        assert_eq!(client_events.events(), vec![
            Event::Connect { peer: request.peer, data: Bytes::new(), request: Some(request.token) },
        ]);

        client.send(&mut client_session, "ping").unwrap();
        server.poll(&mut server_session).await.unwrap();
        assert_eq!(server_events.received(), vec![Bytes::from_static(b"ping")]);

        client.shutdown(&mut client_session);
        server.shutdown(&mut server_session);
    }

    #[tokio::test]
    async fn test_send_before_connect_event() {
        let (_server, _server_session, _, port) = start_server().await;

        let client = ClientEndpoint::new("127.0.0.1", port, "early");
        let (mut session, _) = session_with_listener(fast_config());
        client.connect(&mut session).await.unwrap();

        let err = client.send(&mut session, "too early").unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
    }

    #[tokio::test]
    async fn test_client_disconnect() {
        let (server, mut server_session, server_events, port) = start_server().await;
        let (client, mut client_session, client_events) = connect_client(&server, &mut server_session, port, "alice").await;
        assert_eq!(server_session.num_connected_peers(), 1);

        let token = client.disconnect(&mut client_session).unwrap();
        assert!(token.is_some());

        for _ in 0..20 {
            server.poll(&mut server_session).await.unwrap();
            client.poll(&mut client_session).await.unwrap();
            if client_events.num_disconnects() > 0 {
                break;
            }
        }

        assert_eq!(client_events.events().last(), Some(&Event::Disconnect { peer: client_events.events()[0].peer(), request: token }));
        assert_eq!(server_events.num_disconnects(), 1);
        assert_eq!(server_session.num_connected_peers(), 0);

        assert!(matches!(client.send(&mut client_session, "late"), Err(SessionError::NotConnected)));
    }

    #[tokio::test]
    async fn test_server_reply_and_broadcast() {
        let (server, mut server_session, server_events, port) = start_server().await;
        let (_alice, mut alice_session, alice_events) = connect_client(&server, &mut server_session, port, "alice").await;
        let (_bob, mut bob_session, bob_events) = connect_client(&server, &mut server_session, port, "bob").await;

        let identities = server_events.events().into_iter()
            .filter_map(|e| match e {
                Event::Connect { peer, data, .. } => Some((peer, data)),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(identities.len(), 2);
        let (alice_peer, _) = identities.iter()
            .find(|(_, data)| data.as_ref() == b"alice")
            .unwrap();

        server.send(&mut server_session, *alice_peer, "just for alice").unwrap();
        assert_eq!(server.broadcast(&mut server_session, "for everyone").unwrap(), 2);

        alice_session.poll(Duration::from_millis(200)).await.unwrap();
        bob_session.poll(Duration::from_millis(200)).await.unwrap();

        assert_eq!(alice_events.received(), vec![Bytes::from_static(b"just for alice"), Bytes::from_static(b"for everyone")]);
        assert_eq!(bob_events.received(), vec![Bytes::from_static(b"for everyone")]);
    }

    #[tokio::test]
    async fn test_reliable_in_order() {
        let (server, mut server_session, server_events, port) = start_server().await;
        let (_client, mut client_session, _) = connect_client(&server, &mut server_session, port, "alice").await;

        for i in 0..10 {
            client_session.client_send(Bytes::from(format!("msg {}", i)), 0, PacketFlags::RELIABLE).unwrap();
        }
        for _ in 0..5 {
            server.poll(&mut server_session).await.unwrap();
            client_session.poll(Duration::from_millis(20)).await.unwrap();
        }

        let expected = (0..10)
            .map(|i| Bytes::from(format!("msg {}", i)))
            .collect::<Vec<_>>();
        assert_eq!(server_events.received(), expected);
    }

    #[tokio::test]
    async fn test_failed_connect_can_be_retried() {
        let blocker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let taken_port = blocker.local_addr().unwrap().port() as u32;

        let (mut session, _) = session_with_listener(fast_config());
        let err = ServerEndpoint::new("127.0.0.1", taken_port).connect(&mut session).await.unwrap_err();
        assert!(matches!(err, SessionError::HostCreationFailed(_)));
        assert_eq!(err.class(), ErrorClass::Environment);
        assert!(!session.is_initialized());

        let server = ServerEndpoint::new("127.0.0.1", 0);
        server.connect(&mut session).await.unwrap();
        assert!(session.is_setup());
        assert!(session.is_server());
    }

    #[tokio::test]
    async fn test_invalid_port_can_be_retried() {
        let (server, mut server_session, server_events, port) = start_server().await;
        let (mut session, events) = session_with_listener(fast_config());

        let err = ClientEndpoint::new("127.0.0.1", 70_000, "alice").connect(&mut session).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidPort(70_000)));
        assert!(err.is_caller_bug());
        assert!(!session.is_initialized());
        assert_eq!(session.host(), None);

        let client = ClientEndpoint::new("127.0.0.1", port, "alice");
        client.connect(&mut session).await.unwrap();
        for _ in 0..20 {
            server.poll(&mut server_session).await.unwrap();
            client.poll(&mut session).await.unwrap();
            if session.is_connected() {
                break;
            }
        }
        assert!(session.is_connected());
        assert_eq!(server_events.take_events(), vec![
            Event::Connect { peer: server_session.connected_peers().next().unwrap(), data: Bytes::from_static(b"alice"), request: None },
        ]);
        assert_eq!(events.num_connects(), 1);
        server.shutdown(&mut server_session);
    }

    #[tokio::test]
    async fn test_oversized_identity_is_a_caller_bug() {
        let (mut session, _) = session_with_listener(fast_config());
        let identity = "x".repeat(SessionConfig::default().transport.max_connect_data + 1);

        let err = ClientEndpoint::new("127.0.0.1", 2330, identity).connect(&mut session).await.unwrap_err();
        assert!(matches!(err, SessionError::ConnectDataTooLarge { .. }));
        assert!(err.is_caller_bug());
        assert!(!session.is_initialized());
    }

    #[tokio::test]
    async fn test_connect_on_initialized_session_leaves_it_alone() {
        let (_server, mut session, _, port) = start_server().await;

        let err = ClientEndpoint::new("127.0.0.1", port, "alice").connect(&mut session).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyInitialized));
        assert!(session.is_setup());
        assert!(session.is_server());
    }

    #[tokio::test]
    async fn test_connect_to_silent_server_never_disconnects() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port() as u32;

        let client = ClientEndpoint::new("127.0.0.1", port, "alice");
        let (mut session, events) = session_with_listener(fast_config());
        client.connect(&mut session).await.unwrap();

        client.poll(&mut session).await.unwrap();
        assert!(session.is_connecting());
        assert_eq!(events.num_connects(), 0);
        assert_eq!(events.num_disconnects(), 0);
    }
}
