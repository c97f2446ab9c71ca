use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use rustc_hash::FxHashSet;
use tracing::{debug, info, trace, warn};
use crate::config::SessionConfig;
use crate::session::error::SessionError;
use crate::session::event::{ConnectRequest, Event, RequestToken};
use crate::session::listener::{Listener, ListenerRegistry};
use crate::transport::reliable_udp::ReliableUdpTransport;
use crate::transport::{HostAddress, HostHandle, PacketFlags, PeerHandle, TransportBinding, TransportError, TransportEvent};

/// The role of the session's host. A session plays exactly one role between creating its host
///  and shutting down.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Role {
    #[default]
    Uninitialized,
    Server,
    Client,
}

/// A client's connection to its server
#[derive(Clone, Debug)]
struct ActivePeer {
    peer: PeerHandle,
    /// set when the Connect event was seen
    connected: bool,
    connect_request: RequestToken,
    disconnect_request: Option<RequestToken>,
}

/// The host session state machine.
///
/// ```ascii
/// Uninitialized -initialize()-> Initialized -create_server()-> Server
///                                           -create_client()-> Client -client_connect()-> Connecting -(Connect event)-> Connected
/// ```
///
/// `shutdown()` returns to `Uninitialized` from anywhere, and is also called on drop.
///
/// All operations take `&mut self`, so a session is confined to a single task. Events are
///  dispatched to the installed [Listener] synchronously from inside [Session::poll]. The
///  listener outlives shutdown, so the same listener serves a retry.
pub struct Session {
    config: SessionConfig,
    transport: Box<dyn TransportBinding>,

    initialized: bool,
    role: Role,
    host: Option<HostHandle>,
    active_peer: Option<ActivePeer>,
    /// server side: peers that connected and did not disconnect yet
    connected_peers: FxHashSet<PeerHandle>,

    listeners: ListenerRegistry,
    next_request: u64,
}

impl Session {
    /// Creates a session using the built-in reliable UDP transport
    pub fn new(config: SessionConfig) -> Session {
        let transport = ReliableUdpTransport::new(Arc::new(config.transport.clone()));
        Self::with_transport(Box::new(transport), config)
    }

    pub fn with_transport(transport: Box<dyn TransportBinding>, config: SessionConfig) -> Session {
        Session {
            config,
            transport,
            initialized: false,
            role: Role::Uninitialized,
            host: None,
            active_peer: None,
            connected_peers: FxHashSet::default(),
            listeners: ListenerRegistry::default(),
            next_request: 1,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn install_listener(&mut self, listener: Box<dyn Listener>) -> Option<Box<dyn Listener>> {
        self.listeners.install(listener)
    }

    pub fn uninstall_listener(&mut self) -> Option<Box<dyn Listener>> {
        self.listeners.uninstall()
    }

    pub fn listener_mut(&mut self) -> Result<&mut dyn Listener, SessionError> {
        self.listeners.lookup()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    /// initialized and a host was created
    pub fn is_setup(&self) -> bool {
        self.initialized && self.host.is_some()
    }

    /// a connect was requested, and neither its Connect nor its failure was seen yet
    pub fn is_connecting(&self) -> bool {
        self.active_peer.as_ref()
            .map(|p| !p.connected)
            .unwrap_or(false)
    }

    pub fn is_connected(&self) -> bool {
        self.active_peer.as_ref()
            .map(|p| p.connected)
            .unwrap_or(false)
    }

    pub fn host(&self) -> Option<HostHandle> {
        self.host
    }

    pub fn active_peer(&self) -> Option<PeerHandle> {
        self.active_peer.as_ref()
            .map(|p| p.peer)
    }

    pub fn connected_peers(&self) -> impl Iterator<Item=PeerHandle> + '_ {
        self.connected_peers.iter().copied()
    }

    pub fn num_connected_peers(&self) -> usize {
        self.connected_peers.len()
    }

    /// the address the host's socket is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.host
            .and_then(|h| self.transport.local_addr(h).ok())
    }

    pub fn initialize(&mut self) -> Result<(), SessionError> {
        if self.initialized {
            return Err(SessionError::AlreadyInitialized.logged());
        }
        if let Err(e) = self.config.validate() {
            return Err(SessionError::TransportInitError(TransportError::InvalidConfig(e.to_string())).logged());
        }

        self.transport.initialize()
            .map_err(|e| SessionError::TransportInitError(e).logged())?;
        self.initialized = true;
        debug!("session initialized");
        Ok(())
    }

    fn check_can_create_host(&self) -> Result<(), SessionError> {
        if !self.initialized {
            return Err(SessionError::NotInitialized.logged());
        }
        if self.host.is_some() {
            return Err(SessionError::HostAlreadyExists.logged());
        }
        Ok(())
    }

    fn check_port(port: u32) -> Result<u16, SessionError> {
        u16::try_from(port)
            .map_err(|_| SessionError::InvalidPort(port).logged())
    }

    fn check_channel_count(channels: u32) -> Result<u8, SessionError> {
        match u8::try_from(channels) {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(SessionError::InvalidChannelCount(channels).logged()),
        }
    }

    /// Creates a host bound to `address:port`, accepting up to `max_clients` connections
    pub async fn create_server(&mut self, address: &str, port: u32, channels: u32, max_clients: u32) -> Result<(), SessionError> {
        self.check_can_create_host()?;
        let port = Self::check_port(port)?;
        let channels = Self::check_channel_count(channels)?;

        let bind_addr = HostAddress::new(address, port);
        let host = self.transport.create_host(Some(bind_addr.clone()), max_clients as usize, channels).await
            .map_err(|e| SessionError::HostCreationFailed(e).logged())?;

        self.host = Some(host);
        self.role = Role::Server;
        info!("server host {:?} listening on {} with {} channels for up to {} clients", host, bind_addr, channels, max_clients);
        Ok(())
    }

    /// Creates an unbound host for a single outgoing connection
    pub async fn create_client(&mut self, channels: u32) -> Result<(), SessionError> {
        self.check_can_create_host()?;
        let channels = Self::check_channel_count(channels)?;

        let host = self.transport.create_host(None, 1, channels).await
            .map_err(|e| SessionError::HostCreationFailed(e).logged())?;

        self.host = Some(host);
        self.role = Role::Client;
        info!("client host {:?} created with {} channels", host, channels);
        Ok(())
    }

    fn client_host(&self) -> Result<HostHandle, SessionError> {
        if !self.initialized {
            return Err(SessionError::NotInitialized.logged());
        }
        match (self.role, self.host) {
            (Role::Client, Some(host)) => Ok(host),
            _ => Err(SessionError::NotAClientHost.logged()),
        }
    }

    fn next_request_token(&mut self) -> RequestToken {
        let token = RequestToken::from_raw(self.next_request);
        self.next_request += 1;
        token
    }

    /// Requests a connection to a server, see [Session::client_connect_with_data]
    pub async fn client_connect(&mut self, address: &str, port: u32, channels: u32) -> Result<ConnectRequest, SessionError> {
        self.client_connect_with_data(address, port, channels, Bytes::new()).await
    }

    /// Requests a connection to a server, sending `connect_data` along (e.g. the client's
    ///  identity). `channels == 0` requests as many channels as the client host has.
    ///
    /// This only starts the handshake: the connection exists once a Connect event for the
    ///  returned peer was dispatched.
    pub async fn client_connect_with_data(&mut self, address: &str, port: u32, channels: u32, connect_data: Bytes) -> Result<ConnectRequest, SessionError> {
        let host = self.client_host()?;
        let port = Self::check_port(port)?;
        let channels = match channels {
            0 => 0,
            n => Self::check_channel_count(n)?,
        };
        let max_connect_data = self.config.transport.max_connect_data;
        if connect_data.len() > max_connect_data {
            return Err(SessionError::ConnectDataTooLarge { len: connect_data.len(), max: max_connect_data }.logged());
        }

        let peer = self.transport.connect(host, HostAddress::new(address, port), channels, connect_data).await
            .map_err(|e| SessionError::ConnectRequestFailed(e).logged())?;

        let token = self.next_request_token();
        if let Some(previous) = self.active_peer.replace(ActivePeer {
            peer,
            connected: false,
            connect_request: token,
            disconnect_request: None,
        }) {
            warn!("connect request {:?} supersedes the connection to {:?}", token, previous.peer);
        }
        debug!("requested connection to {}:{} as {:?} ({:?})", address, port, peer, token);
        Ok(ConnectRequest { peer, token })
    }

    /// Requests a graceful disconnect of the client's connection. Completion is signalled by a
    ///  later Disconnect event (or a failed connect if the handshake was still running). Does
    ///  nothing if there is no connection.
    pub fn client_disconnect(&mut self) -> Result<Option<RequestToken>, SessionError> {
        let Some(active) = &self.active_peer else {
            trace!("client disconnect without a connection - ignoring");
            return Ok(None);
        };
        if let Some(token) = active.disconnect_request {
            return Ok(Some(token));
        }
        let peer = active.peer;

        match self.transport.disconnect(peer) {
            Ok(()) => {}
            Err(TransportError::UnknownPeer(_)) => {
                debug!("{:?} is gone already", peer);
                self.active_peer = None;
                return Ok(None);
            }
            Err(e) => return Err(SessionError::DisconnectFailed(e).logged()),
        }

        let token = self.next_request_token();
        if let Some(active) = &mut self.active_peer {
            active.disconnect_request = Some(token);
        }
        debug!("requested disconnect of {:?} ({:?})", peer, token);
        Ok(Some(token))
    }

    /// Services the host for events, dispatching each of them to the listener before the next
    ///  one is fetched. Each wait for an event is bounded by `timeout`, and `poll` returns as
    ///  soon as a wait comes back empty. Returns the number of dispatched events.
    pub async fn poll(&mut self, timeout: Duration) -> Result<usize, SessionError> {
        if !self.initialized {
            return Err(SessionError::NotInitialized.logged());
        }
        let host = self.host
            .ok_or_else(|| SessionError::NoHost.logged())?;
        if !self.listeners.is_installed() {
            return Err(SessionError::NoListenerInstalled.logged());
        }

        let mut num_dispatched = 0;
        while let Some(transport_event) = self.transport.service(host, timeout).await
            .map_err(|e| SessionError::PollFailed(e).logged())?
        {
            let event = self.apply(transport_event);
            self.listeners.dispatch(&event)?;
            num_dispatched += 1;
        }
        Ok(num_dispatched)
    }

    /// Updates the session's state for an event, attaching the originating request
    fn apply(&mut self, event: TransportEvent) -> Event {
        let is_active = |active: &Option<ActivePeer>, peer: PeerHandle| {
            active.as_ref().map(|a| a.peer == peer).unwrap_or(false)
        };

        match event {
            TransportEvent::Connect { peer, data } => {
                let mut request = None;
                if self.role == Role::Server {
                    self.connected_peers.insert(peer);
                    info!("{:?} connected", peer);
                }
                else if is_active(&self.active_peer, peer) {
                    if let Some(active) = &mut self.active_peer {
                        active.connected = true;
                        request = Some(active.connect_request);
                    }
                    info!("connected to server as {:?}", peer);
                }
                Event::Connect { peer, data, request }
            }
            TransportEvent::Disconnect { peer } => {
                let mut request = None;
                if self.connected_peers.remove(&peer) {
                    info!("{:?} disconnected", peer);
                }
                if is_active(&self.active_peer, peer) {
                    request = self.active_peer.take()
                        .and_then(|a| a.disconnect_request);
                    info!("disconnected from server");
                }
                Event::Disconnect { peer, request }
            }
            TransportEvent::Receive { peer, channel, data } => {
                trace!("received {} bytes from {:?} on channel {}", data.len(), peer, channel);
                Event::Receive { peer, channel, data }
            }
            TransportEvent::ConnectFailed { peer } => {
                let mut request = None;
                if is_active(&self.active_peer, peer) {
                    request = self.active_peer.take()
                        .map(|a| a.connect_request);
                    warn!("connect request {:?} failed", request);
                }
                Event::ConnectFailed { peer, request }
            }
        }
    }

    fn check_host(&self) -> Result<(), SessionError> {
        if !self.initialized {
            return Err(SessionError::NotInitialized.logged());
        }
        if self.host.is_none() {
            return Err(SessionError::NoHost.logged());
        }
        Ok(())
    }

    /// Sends `data` on `channel`. A server must name a connected peer as `target`; a client
    ///  sends to its server, and `target` is either `None` or the client's active peer.
    pub fn send(&mut self, target: Option<PeerHandle>, data: Bytes, channel: u8, flags: PacketFlags) -> Result<(), SessionError> {
        self.check_host()?;

        let peer = match self.role {
            Role::Server => {
                let peer = target
                    .ok_or_else(|| SessionError::NotAClientHost.logged())?;
                if !self.connected_peers.contains(&peer) {
                    return Err(SessionError::UnknownPeer(peer).logged());
                }
                peer
            }
            Role::Client => {
                let active = match &self.active_peer {
                    Some(a) if a.connected => a.peer,
                    _ => return Err(SessionError::NotConnected.logged()),
                };
                if let Some(peer) = target {
                    if peer != active {
                        return Err(SessionError::UnknownPeer(peer).logged());
                    }
                }
                active
            }
            Role::Uninitialized => return Err(SessionError::NoHost.logged()),
        };

        trace!("sending {} bytes to {:?} on channel {}", data.len(), peer, channel);
        self.transport.send(peer, data, channel, flags)
            .map_err(|e| SessionError::from_send(e).logged())
    }

    pub fn client_send(&mut self, data: Bytes, channel: u8, flags: PacketFlags) -> Result<(), SessionError> {
        if self.role != Role::Client {
            return Err(SessionError::NotAClientHost.logged());
        }
        self.send(None, data, channel, flags)
    }

    pub fn server_send(&mut self, peer: PeerHandle, data: Bytes, channel: u8, flags: PacketFlags) -> Result<(), SessionError> {
        if self.role != Role::Server {
            return Err(SessionError::NotAServerHost.logged());
        }
        self.send(Some(peer), data, channel, flags)
    }

    /// Sends `data` to every connected peer, returning the number of peers it was sent to
    pub fn broadcast(&mut self, data: Bytes, channel: u8, flags: PacketFlags) -> Result<usize, SessionError> {
        self.check_host()?;
        if self.role != Role::Server {
            return Err(SessionError::NotAServerHost.logged());
        }

        let mut peers = self.connected_peers.iter().copied().collect::<Vec<_>>();
        peers.sort();
        for &peer in &peers {
            self.transport.send(peer, data.clone(), channel, flags)
                .map_err(|e| SessionError::from_send(e).logged())?;
        }
        Ok(peers.len())
    }

    /// Destroys the host, deinitializes the transport and resets the session. This never
    ///  fails and may be called any number of times.
    pub fn shutdown(&mut self) {
        if let Some(host) = self.host.take() {
            self.transport.destroy_host(host);
        }
        if self.initialized {
            self.transport.deinitialize();
            info!("session shut down");
        }

        self.initialized = false;
        self.role = Role::Uninitialized;
        self.active_peer = None;
        self.connected_peers.clear();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
