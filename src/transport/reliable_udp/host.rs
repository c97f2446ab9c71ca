use std::collections::hash_map::Entry;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};
use crate::config::TransportConfig;
use crate::transport::handles::SlotArena;
use crate::transport::reliable_udp::packet_header::{AcceptBody, AckBody, ConnectBody, DataHeader, PacketHeader, PacketKind};
use crate::transport::reliable_udp::peer::{build_datagram, Peer, PeerState, TickOutcome};
use crate::transport::{HostHandle, PacketFlags, PeerHandle, TransportError, TransportEvent};

/// A bound UDP socket with a fixed number of peer slots. All protocol work happens while the
///  host is serviced: incoming datagrams are processed, retransmits and pings are sent, and
///  timeouts are detected.
pub struct Host {
    handle: HostHandle,
    socket: UdpSocket,
    config: Arc<TransportConfig>,
    channel_count: u8,
    peers: SlotArena<Peer>,
    by_addr: FxHashMap<SocketAddr, (u16, u32)>,
    events: VecDeque<TransportEvent>,
    recv_buf: Vec<u8>,
}

impl Host {
    pub async fn bind(handle: HostHandle, addr: SocketAddr, max_peers: usize, channel_count: u8, config: Arc<TransportConfig>) -> Result<Host, TransportError> {
        if channel_count == 0 {
            return Err(TransportError::InvalidChannelCount(channel_count));
        }

        let socket = UdpSocket::bind(addr).await?;
        // sends are non-blocking, and they fail until the reactor has seen the socket writable
        socket.writable().await?;
        info!("{:?}: bound to {:?} with {} peer slots and {} channels", handle, socket.local_addr()?, max_peers, channel_count);

        let recv_buf = vec![0u8; PacketHeader::SERIALIZED_LEN + 8 + config.max_payload_size.max(config.max_connect_data)];
        Ok(Host {
            handle,
            socket,
            config,
            channel_count,
            peers: SlotArena::with_capacity(max_peers),
            by_addr: FxHashMap::default(),
            events: VecDeque::new(),
            recv_buf,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn is_ipv6(&self) -> bool {
        self.socket.local_addr()
            .map(|a| a.is_ipv6())
            .unwrap_or(false)
    }

    fn peer_handle(&self, slot: u16, generation: u32) -> PeerHandle {
        PeerHandle { host: self.handle, slot, generation }
    }

    fn peer_mut(&mut self, peer: PeerHandle) -> Result<&mut Peer, TransportError> {
        self.peers.get_mut(peer.slot, peer.generation)
            .ok_or(TransportError::UnknownPeer(peer))
    }

    pub fn connect(&mut self, addr: SocketAddr, channel_count: u8, connect_data: &[u8]) -> Result<PeerHandle, TransportError> {
        let channel_count = match channel_count {
            0 => self.channel_count,
            n => n,
        };
        if connect_data.len() > self.config.max_connect_data {
            return Err(TransportError::PayloadTooLarge { len: connect_data.len(), max: self.config.max_connect_data });
        }
        if self.by_addr.contains_key(&addr) {
            warn!("{:?}: replacing existing connection to {:?}", self.handle, addr);
            if let Some((slot, generation)) = self.by_addr.get(&addr).copied() {
                self.drop_peer(slot, generation);
            }
        }

        let connection_id = rand::random::<u32>();
        let now = Instant::now();
        let (peer, datagram) = Peer::connecting(addr, connection_id, channel_count, connect_data, self.config.clone(), now);
        let (slot, generation) = self.peers.insert(peer)
            .ok_or(TransportError::NoFreePeerSlot(self.peers.capacity()))?;
        self.by_addr.insert(addr, (slot, generation));

        debug!("{:?}: connecting to {:?} with {} channels, connection id {:08x}", self.handle, addr, channel_count, connection_id);
        send_datagram(&self.socket, addr, &datagram);
        Ok(self.peer_handle(slot, generation))
    }

    /// Starts a graceful disconnect. A peer that is still connecting is dropped right away and
    ///  reported as a failed connect.
    pub fn disconnect(&mut self, peer: PeerHandle) -> Result<(), TransportError> {
        let now = Instant::now();
        let p = self.peer_mut(peer)?;
        match p.state() {
            PeerState::Connected => {
                let addr = p.addr();
                let num_abandoned = p.num_unacked();
                let datagram = p.start_disconnect(now);
                debug!("{:?}: disconnecting {:?}, abandoning {} unacknowledged packets", peer, addr, num_abandoned);
                send_datagram(&self.socket, addr, &datagram);
            }
            PeerState::Connecting => {
                debug!("{:?}: cancelling connect to {:?}", peer, p.addr());
                self.release_peer(peer.slot, peer.generation);
                self.events.push_back(TransportEvent::ConnectFailed { peer });
            }
            PeerState::Disconnecting => {
                trace!("{:?}: already disconnecting", peer);
            }
        }
        Ok(())
    }

    pub fn send(&mut self, peer: PeerHandle, data: &[u8], channel: u8, flags: PacketFlags) -> Result<(), TransportError> {
        let now = Instant::now();
        let p = self.peer_mut(peer)?;
        if p.state() != PeerState::Connected {
            return Err(TransportError::NotConnected(peer));
        }
        let addr = p.addr();
        let datagram = p.send(data, channel, flags, now)?;
        trace!("{:?}: sending {} bytes on channel {} ({:?})", peer, data.len(), channel, flags);
        send_datagram(&self.socket, addr, &datagram);
        Ok(())
    }

    /// Returns the next event, processing traffic for up to `timeout` while waiting for one.
    pub async fn service(&mut self, timeout: Duration) -> Result<Option<TransportEvent>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }

            self.drain_socket();
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }

            let now = Instant::now();
            self.housekeeping(now);
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }

            if now >= deadline {
                return Ok(None);
            }

            let wait = (deadline - now).min(self.config.tick_interval);
            if let Ok(Err(e)) = time::timeout(wait, self.socket.readable()).await {
                return Err(e.into());
            }
        }
    }

    fn drain_socket(&mut self) {
        let mut buf = std::mem::take(&mut self.recv_buf);
        loop {
            match self.socket.try_recv_from(&mut buf) {
                Ok((num_read, from)) => {
                    self.on_datagram(from, &buf[..num_read], Instant::now());
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    break;
                }
                Err(e) => {
                    // e.g. ICMP 'port unreachable' surfacing as ConnectionReset on some platforms
                    debug!("{:?}: socket error: {}", self.handle, e);
                    break;
                }
            }
            if !self.events.is_empty() {
                break;
            }
        }
        self.recv_buf = buf;
    }

    fn on_datagram(&mut self, from: SocketAddr, datagram: &[u8], now: Instant) {
        trace!("{:?}: received {} bytes from {:?}", self.handle, datagram.len(), from);

        let (header, body) = match PacketHeader::deser(datagram) {
            Ok(x) => x,
            Err(e) => {
                debug!("{:?}: invalid datagram from {:?} - dropping: {}", self.handle, from, e);
                return;
            }
        };

        if header.kind == PacketKind::Connect {
            self.on_connect(from, header.connection_id, body, now);
            return;
        }

        let Some((slot, generation)) = self.by_addr.get(&from).copied() else {
            debug!("{:?}: {:?} from unknown address {:?} - dropping", self.handle, header.kind, from);
            return;
        };
        let handle = self.peer_handle(slot, generation);
        let Some(peer) = self.peers.get_mut(slot, generation) else {
            warn!("{:?}: address {:?} maps to a released peer slot - dropping", self.handle, from);
            return;
        };
        if peer.connection_id() != header.connection_id {
            debug!("{:?}: {:?} from {:?} for stale connection {:08x} - dropping", self.handle, header.kind, from, header.connection_id);
            return;
        }
        peer.on_received(now);

        match header.kind {
            PacketKind::Connect => {}
            PacketKind::Accept => {
                match AcceptBody::deser(body) {
                    Ok(accept) => {
                        if peer.on_accept(accept) {
                            debug!("{:?}: connected to {:?}", handle, from);
                            self.events.push_back(TransportEvent::Connect { peer: handle, data: Bytes::new() });
                        }
                    }
                    Err(e) => debug!("{:?}: invalid ACCEPT from {:?} - dropping: {}", self.handle, from, e),
                }
            }
            PacketKind::Refuse => {
                if peer.state() == PeerState::Connecting {
                    debug!("{:?}: connection refused by {:?}", handle, from);
                    self.release_peer(slot, generation);
                    self.events.push_back(TransportEvent::ConnectFailed { peer: handle });
                }
            }
            PacketKind::Disconnect => {
                let ack = peer.control_datagram(PacketKind::DisconnectAck, now);
                let was_connecting = peer.state() == PeerState::Connecting;
                send_datagram(&self.socket, from, &ack);

                debug!("{:?}: {:?} disconnected", handle, from);
                self.release_peer(slot, generation);
                self.events.push_back(if was_connecting {
                    TransportEvent::ConnectFailed { peer: handle }
                }
                else {
                    TransportEvent::Disconnect { peer: handle }
                });
            }
            PacketKind::DisconnectAck => {
                if peer.state() == PeerState::Disconnecting {
                    debug!("{:?}: disconnect from {:?} acknowledged", handle, from);
                    self.release_peer(slot, generation);
                    self.events.push_back(TransportEvent::Disconnect { peer: handle });
                }
            }
            PacketKind::Data => {
                let mut parse_buf = body;
                let data_header = match DataHeader::deser(&mut parse_buf) {
                    Ok(h) => h,
                    Err(e) => {
                        debug!("{:?}: invalid DATA from {:?} - dropping: {}", self.handle, from, e);
                        return;
                    }
                };
                let (ack, delivered) = peer.on_data(data_header, parse_buf, now);
                if let Some(ack) = ack {
                    send_datagram(&self.socket, from, &ack);
                }
                for data in delivered {
                    self.events.push_back(TransportEvent::Receive { peer: handle, channel: data_header.channel, data });
                }
            }
            PacketKind::Ack => {
                match AckBody::deser(body) {
                    Ok(ack) => peer.on_ack(ack),
                    Err(e) => debug!("{:?}: invalid ACK from {:?} - dropping: {}", self.handle, from, e),
                }
            }
            PacketKind::Ping => {}
        }
    }

    fn on_connect(&mut self, from: SocketAddr, connection_id: u32, body: &[u8], now: Instant) {
        let connect = match ConnectBody::deser(body) {
            Ok(c) => c,
            Err(e) => {
                debug!("{:?}: invalid CONNECT from {:?} - dropping: {}", self.handle, from, e);
                return;
            }
        };
        if connect.channel_count == 0 {
            debug!("{:?}: CONNECT from {:?} without channels - dropping", self.handle, from);
            return;
        }
        if connect.connect_data.len() > self.config.max_connect_data {
            debug!("{:?}: CONNECT from {:?} with {} bytes of connect data - dropping", self.handle, from, connect.connect_data.len());
            return;
        }

        if let Some((slot, generation)) = self.by_addr.get(&from).copied() {
            if let Some(existing) = self.peers.get_mut(slot, generation) {
                if existing.connection_id() == connection_id {
                    if existing.state() == PeerState::Connected {
                        trace!("{:?}: duplicate CONNECT from {:?} - re-sending ACCEPT", self.handle, from);
                        let accept = existing.accept_datagram(now);
                        send_datagram(&self.socket, from, &accept);
                    }
                    return;
                }
            }
            debug!("{:?}: new connection from {:?} replaces the existing one", self.handle, from);
            self.drop_peer(slot, generation);
        }

        let channel_count = connect.channel_count.min(self.channel_count);
        let peer = Peer::accepted(from, connection_id, channel_count, self.config.clone(), now);
        let (slot, generation) = match self.peers.insert(peer) {
            Some(x) => x,
            None => {
                info!("{:?}: all {} peer slots are in use - refusing connection from {:?}", self.handle, self.peers.capacity(), from);
                let refuse = build_datagram(PacketKind::Refuse, connection_id, |_| {});
                send_datagram(&self.socket, from, &refuse);
                return;
            }
        };
        self.by_addr.insert(from, (slot, generation));

        let handle = self.peer_handle(slot, generation);
        info!("{:?}: accepted connection from {:?} with {} channels", handle, from, channel_count);
        if let Some(peer) = self.peers.get_mut(slot, generation) {
            let accept = peer.accept_datagram(now);
            send_datagram(&self.socket, from, &accept);
        }
        self.events.push_back(TransportEvent::Connect { peer: handle, data: Bytes::copy_from_slice(connect.connect_data) });
    }

    fn housekeeping(&mut self, now: Instant) {
        let mut finished = Vec::new();
        let mut outbox = Vec::new();
        for (slot, generation, peer) in self.peers.iter_mut() {
            let outcome = peer.tick(now, &mut outbox);
            for datagram in outbox.drain(..) {
                send_datagram(&self.socket, peer.addr(), &datagram);
            }
            if outcome != TickOutcome::Alive {
                finished.push((slot, generation, outcome));
            }
        }

        for (slot, generation, outcome) in finished {
            let handle = self.peer_handle(slot, generation);
            debug!("{:?}: {:?}", handle, outcome);
            self.release_peer(slot, generation);
            self.events.push_back(match outcome {
                TickOutcome::ConnectFailed => TransportEvent::ConnectFailed { peer: handle },
                _ => TransportEvent::Disconnect { peer: handle },
            });
        }
    }

    /// Removes a peer because its address was taken over, reporting it as gone
    fn drop_peer(&mut self, slot: u16, generation: u32) {
        let handle = self.peer_handle(slot, generation);
        if let Some(peer) = self.release_peer(slot, generation) {
            self.events.push_back(match peer.state() {
                PeerState::Connecting => TransportEvent::ConnectFailed { peer: handle },
                _ => TransportEvent::Disconnect { peer: handle },
            });
        }
    }

    fn release_peer(&mut self, slot: u16, generation: u32) -> Option<Peer> {
        let peer = self.peers.remove(slot, generation)?;
        if let Entry::Occupied(e) = self.by_addr.entry(peer.addr()) {
            if *e.get() == (slot, generation) {
                e.remove();
            }
        }
        Some(peer)
    }

    /// Best-effort DISCONNECT to every connected peer. No events are produced.
    pub fn shutdown(&mut self) {
        let now = Instant::now();
        for (_, _, peer) in self.peers.iter_mut() {
            if peer.state() == PeerState::Connected {
                let datagram = peer.control_datagram(PacketKind::Disconnect, now);
                send_datagram(&self.socket, peer.addr(), &datagram);
            }
        }
        self.peers.clear();
        self.by_addr.clear();
        self.events.clear();
        debug!("{:?}: shut down", self.handle);
    }
}

/// Datagrams are handed to the OS without waiting. If that fails, the datagram counts as lost.
fn send_datagram(socket: &UdpSocket, to: SocketAddr, datagram: &[u8]) {
    if let Err(e) = socket.try_send_to(datagram, to) {
        debug!("error sending datagram to {:?} - treating it as lost: {}", to, e);
    }
}
