use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::config::TransportConfig;
use crate::transport::backoff::RetransmitBackoff;
use crate::transport::reliable_udp::packet_header::{AcceptBody, AckBody, ConnectBody, DataHeader, PacketHeader, PacketKind};
use crate::transport::{PacketFlags, TransportError};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PeerState {
    /// CONNECT sent, waiting for ACCEPT
    Connecting,
    Connected,
    /// DISCONNECT sent, waiting for DISCONNECT_ACK
    Disconnecting,
}

/// What housekeeping decided about a peer
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TickOutcome {
    Alive,
    /// the CONNECT request was retransmitted too often without an answer
    ConnectFailed,
    /// a connected peer stopped responding
    TimedOut,
    /// a local disconnect finished, with or without DISCONNECT_ACK
    DisconnectComplete,
}

struct PendingDatagram {
    datagram: Bytes,
    backoff: RetransmitBackoff,
}

#[derive(Default)]
struct ChannelState {
    next_outgoing_reliable: u32,
    next_outgoing_unreliable: u32,
    unacked: BTreeMap<u32, PendingDatagram>,

    next_incoming_reliable: u32,
    held_back: BTreeMap<u32, Bytes>,
    newest_incoming_unreliable: Option<u32>,
}

/// Connection state for a single remote address. This is pure protocol logic: datagrams to be
///  sent are returned to the caller (the host), which owns the socket.
pub struct Peer {
    addr: SocketAddr,
    connection_id: u32,
    state: PeerState,
    channels: Vec<ChannelState>,
    /// CONNECT or DISCONNECT waiting for its response
    pending_control: Option<PendingDatagram>,
    last_received: Instant,
    last_sent: Instant,
    config: Arc<TransportConfig>,
}

impl Peer {
    /// Creates the peer for an outbound connection, returning it with the CONNECT datagram
    pub fn connecting(addr: SocketAddr, connection_id: u32, channel_count: u8, connect_data: &[u8], config: Arc<TransportConfig>, now: Instant) -> (Peer, Bytes) {
        let datagram = build_datagram(PacketKind::Connect, connection_id, |buf| {
            ConnectBody { channel_count, connect_data }.ser(buf);
        });

        let peer = Peer {
            addr,
            connection_id,
            state: PeerState::Connecting,
            channels: Self::new_channels(channel_count),
            pending_control: Some(PendingDatagram {
                datagram: datagram.clone(),
                backoff: RetransmitBackoff::new(now, config.retransmit_initial, config.retransmit_max),
            }),
            last_received: now,
            last_sent: now,
            config,
        };
        (peer, datagram)
    }

    /// Creates the peer for an inbound connection that was accepted
    pub fn accepted(addr: SocketAddr, connection_id: u32, channel_count: u8, config: Arc<TransportConfig>, now: Instant) -> Peer {
        Peer {
            addr,
            connection_id,
            state: PeerState::Connected,
            channels: Self::new_channels(channel_count),
            pending_control: None,
            last_received: now,
            last_sent: now,
            config,
        }
    }

    fn new_channels(channel_count: u8) -> Vec<ChannelState> {
        (0..channel_count)
            .map(|_| ChannelState::default())
            .collect()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn channel_count(&self) -> u8 {
        self.channels.len() as u8
    }

    pub fn num_unacked(&self) -> usize {
        self.channels.iter()
            .map(|c| c.unacked.len())
            .sum()
    }

    pub fn accept_datagram(&mut self, now: Instant) -> Bytes {
        self.last_sent = now;
        build_datagram(PacketKind::Accept, self.connection_id, |buf| {
            AcceptBody { channel_count: self.channel_count() }.ser(buf);
        })
    }

    pub fn control_datagram(&mut self, kind: PacketKind, now: Instant) -> Bytes {
        self.last_sent = now;
        build_datagram(kind, self.connection_id, |_| {})
    }

    pub fn on_received(&mut self, now: Instant) {
        self.last_received = now;
    }

    /// Handles ACCEPT, returning `true` if this completed the connection
    pub fn on_accept(&mut self, accept: AcceptBody) -> bool {
        if self.state != PeerState::Connecting {
            return false;
        }
        if accept.channel_count == 0 || accept.channel_count > self.channel_count() {
            debug!("peer {:?} accepted with invalid channel count {} - ignoring", self.addr, accept.channel_count);
            return false;
        }

        self.channels.truncate(accept.channel_count as usize);
        self.pending_control = None;
        self.state = PeerState::Connected;
        true
    }

    /// Starts a graceful disconnect, returning the DISCONNECT datagram. Reliable packets that
    ///  are still unacknowledged are abandoned.
    pub fn start_disconnect(&mut self, now: Instant) -> Bytes {
        let datagram = self.control_datagram(PacketKind::Disconnect, now);
        for channel in self.channels.iter_mut() {
            channel.unacked.clear();
        }
        self.pending_control = Some(PendingDatagram {
            datagram: datagram.clone(),
            backoff: RetransmitBackoff::new(now, self.config.retransmit_initial, self.config.retransmit_max),
        });
        self.state = PeerState::Disconnecting;
        datagram
    }

    fn check_channel(&self, channel: u8) -> Result<(), TransportError> {
        if channel >= self.channel_count() {
            return Err(TransportError::InvalidChannel { channel, channel_count: self.channel_count() });
        }
        Ok(())
    }

    /// Builds the DATA datagram for an application payload, registering it for retransmission
    ///  if it is reliable.
    pub fn send(&mut self, payload: &[u8], channel: u8, flags: PacketFlags, now: Instant) -> Result<Bytes, TransportError> {
        self.check_channel(channel)?;
        if payload.len() > self.config.max_payload_size {
            return Err(TransportError::PayloadTooLarge { len: payload.len(), max: self.config.max_payload_size });
        }

        let channel_state = &mut self.channels[channel as usize];
        let sequence = if flags.contains(PacketFlags::RELIABLE) {
            let s = channel_state.next_outgoing_reliable;
            channel_state.next_outgoing_reliable = s.wrapping_add(1);
            s
        }
        else if flags.contains(PacketFlags::UNSEQUENCED) {
            0
        }
        else {
            let s = channel_state.next_outgoing_unreliable;
            channel_state.next_outgoing_unreliable = s.wrapping_add(1);
            s
        };

        let datagram = build_datagram(PacketKind::Data, self.connection_id, |buf| {
            DataHeader { channel, flags, sequence }.ser(buf);
            buf.put_slice(payload);
        });

        if flags.contains(PacketFlags::RELIABLE) {
            channel_state.unacked.insert(sequence, PendingDatagram {
                datagram: datagram.clone(),
                backoff: RetransmitBackoff::new(now, self.config.retransmit_initial, self.config.retransmit_max),
            });
        }

        self.last_sent = now;
        Ok(datagram)
    }

    /// Handles a DATA packet, returning the ACK datagram to send (for reliable packets) and the
    ///  payloads that became deliverable, in delivery order.
    pub fn on_data(&mut self, header: DataHeader, payload: &[u8], now: Instant) -> (Option<Bytes>, Vec<Bytes>) {
        if self.state != PeerState::Connected {
            trace!("DATA from {:?} in state {:?} - dropping", self.addr, self.state);
            return (None, Vec::new());
        }
        if self.check_channel(header.channel).is_err() {
            debug!("DATA from {:?} for invalid channel {} - dropping", self.addr, header.channel);
            return (None, Vec::new());
        }

        let receive_window = self.config.receive_window;
        let channel_state = &mut self.channels[header.channel as usize];
        let mut delivered = Vec::new();

        if header.flags.contains(PacketFlags::RELIABLE) {
            let expected = channel_state.next_incoming_reliable;
            if header.sequence < expected {
                trace!("duplicate reliable packet {} on channel {} - acknowledging again", header.sequence, header.channel);
            }
            else if header.sequence - expected >= receive_window {
                debug!("reliable packet {} on channel {} is beyond the receive window - dropping", header.sequence, header.channel);
                return (None, delivered);
            }
            else if header.sequence == expected {
                delivered.push(Bytes::copy_from_slice(payload));
                let mut next = expected.wrapping_add(1);
                while let Some(held) = channel_state.held_back.remove(&next) {
                    delivered.push(held);
                    next = next.wrapping_add(1);
                }
                channel_state.next_incoming_reliable = next;
            }
            else {
                trace!("reliable packet {} on channel {} arrived ahead of {} - holding it back", header.sequence, header.channel, expected);
                channel_state.held_back
                    .entry(header.sequence)
                    .or_insert_with(|| Bytes::copy_from_slice(payload));
            }

            self.last_sent = now;
            let ack = build_datagram(PacketKind::Ack, self.connection_id, |buf| {
                AckBody { channel: header.channel, sequence: header.sequence }.ser(buf);
            });
            return (Some(ack), delivered);
        }

        if header.flags.contains(PacketFlags::UNSEQUENCED) {
            delivered.push(Bytes::copy_from_slice(payload));
        }
        else if channel_state.newest_incoming_unreliable.map_or(true, |newest| header.sequence > newest) {
            channel_state.newest_incoming_unreliable = Some(header.sequence);
            delivered.push(Bytes::copy_from_slice(payload));
        }
        else {
            trace!("outdated unreliable packet {} on channel {} - dropping", header.sequence, header.channel);
        }
        (None, delivered)
    }

    pub fn on_ack(&mut self, ack: AckBody) {
        if let Some(channel_state) = self.channels.get_mut(ack.channel as usize) {
            if channel_state.unacked.remove(&ack.sequence).is_some() {
                trace!("packet {} on channel {} acknowledged by {:?}", ack.sequence, ack.channel, self.addr);
            }
        }
    }

    /// Periodic housekeeping: retransmits, keep-alive pings and timeouts. Datagrams to be sent
    ///  are appended to `outbox`.
    pub fn tick(&mut self, now: Instant, outbox: &mut Vec<Bytes>) -> TickOutcome {
        let max_retransmits = self.config.max_retransmits;

        if let Some(pending) = &mut self.pending_control {
            if pending.backoff.is_due(now) {
                if pending.backoff.attempts() >= max_retransmits {
                    return match self.state {
                        PeerState::Connecting => TickOutcome::ConnectFailed,
                        _ => TickOutcome::DisconnectComplete,
                    };
                }
                trace!("retransmitting {:?} to {:?}", self.state, self.addr);
                pending.backoff.on_retransmit(now);
                outbox.push(pending.datagram.clone());
                self.last_sent = now;
            }
        }

        if self.state != PeerState::Connected {
            return TickOutcome::Alive;
        }

        if now.duration_since(self.last_received) >= self.config.peer_timeout {
            debug!("nothing received from {:?} for {:?} - timing out", self.addr, self.config.peer_timeout);
            return TickOutcome::TimedOut;
        }

        for (channel, channel_state) in self.channels.iter_mut().enumerate() {
            for (sequence, pending) in channel_state.unacked.iter_mut() {
                if !pending.backoff.is_due(now) {
                    continue;
                }
                if pending.backoff.attempts() >= max_retransmits {
                    debug!("reliable packet {} on channel {} to {:?} was never acknowledged - timing out", sequence, channel, self.addr);
                    return TickOutcome::TimedOut;
                }
                trace!("retransmitting reliable packet {} on channel {} to {:?}", sequence, channel, self.addr);
                pending.backoff.on_retransmit(now);
                outbox.push(pending.datagram.clone());
                self.last_sent = now;
            }
        }

        if now.duration_since(self.last_sent) >= self.config.ping_interval {
            outbox.push(self.control_datagram(PacketKind::Ping, now));
        }

        TickOutcome::Alive
    }
}

pub fn build_datagram(kind: PacketKind, connection_id: u32, body: impl FnOnce(&mut BytesMut)) -> Bytes {
    let mut buf = BytesMut::new();
    PacketHeader::new(kind, connection_id).ser(&mut buf);
    body(&mut buf);
    PacketHeader::finalize_checksum(&mut buf);
    buf.freeze()
}
