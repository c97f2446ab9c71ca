//! A small reliable-UDP protocol on top of tokio's [UdpSocket](tokio::net::UdpSocket), providing
//!  the [TransportBinding] primitives: connection handshake with connect data, channels,
//!  reliable / unreliable / unsequenced delivery, keep-alive pings and timeouts.

mod host;
mod packet_header;
mod peer;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::lookup_host;
use tracing::{debug, info, warn};
use crate::config::TransportConfig;
use crate::transport::reliable_udp::host::Host;
use crate::transport::{HostAddress, HostHandle, PacketFlags, PeerHandle, TransportBinding, TransportError, TransportEvent};

pub struct ReliableUdpTransport {
    config: Arc<TransportConfig>,
    initialized: bool,
    next_host_id: u32,
    hosts: FxHashMap<HostHandle, Host>,
}

impl ReliableUdpTransport {
    pub fn new(config: Arc<TransportConfig>) -> ReliableUdpTransport {
        ReliableUdpTransport {
            config,
            initialized: false,
            next_host_id: 1,
            hosts: FxHashMap::default(),
        }
    }

    fn check_initialized(&self) -> Result<(), TransportError> {
        if !self.initialized {
            return Err(TransportError::NotInitialized);
        }
        Ok(())
    }

    fn host_mut(&mut self, host: HostHandle) -> Result<&mut Host, TransportError> {
        self.check_initialized()?;
        self.hosts.get_mut(&host)
            .ok_or(TransportError::UnknownHost(host))
    }

    /// Resolves a host name, preferring addresses of the requested family
    async fn resolve(address: &HostAddress, prefer_ipv6: bool) -> Result<SocketAddr, TransportError> {
        let candidates = lookup_host((address.host.as_str(), address.port)).await
            .map_err(|e| {
                debug!("resolving {} failed: {}", address, e);
                TransportError::Resolve(address.clone())
            })?
            .collect::<Vec<_>>();

        candidates.iter()
            .find(|a| a.is_ipv6() == prefer_ipv6)
            .or(candidates.first())
            .copied()
            .ok_or_else(|| TransportError::Resolve(address.clone()))
    }
}

impl Default for ReliableUdpTransport {
    fn default() -> Self {
        ReliableUdpTransport::new(Arc::new(TransportConfig::default()))
    }
}

#[async_trait]
impl TransportBinding for ReliableUdpTransport {
    fn initialize(&mut self) -> Result<(), TransportError> {
        if self.initialized {
            return Err(TransportError::AlreadyInitialized);
        }
        self.config.validate()
            .map_err(|e| {
                warn!("invalid transport configuration: {}", e);
                TransportError::InvalidConfig(e.to_string())
            })?;
        self.initialized = true;
        info!("reliable UDP transport initialized");
        Ok(())
    }

    fn deinitialize(&mut self) {
        if !self.initialized {
            return;
        }
        for (_, mut host) in self.hosts.drain() {
            host.shutdown();
        }
        self.initialized = false;
        info!("reliable UDP transport deinitialized");
    }

    async fn create_host(&mut self, bind_addr: Option<HostAddress>, max_peers: usize, channel_count: u8) -> Result<HostHandle, TransportError> {
        self.check_initialized()?;
        if max_peers > u16::MAX as usize + 1 {
            return Err(TransportError::NoFreePeerSlot(max_peers));
        }

        let addr = match &bind_addr {
            Some(a) => Self::resolve(a, false).await?,
            None => SocketAddr::from(([0, 0, 0, 0], 0)),
        };

        let handle = HostHandle::from_raw(self.next_host_id);
        let host = Host::bind(handle, addr, max_peers, channel_count, self.config.clone()).await?;
        self.next_host_id += 1;
        self.hosts.insert(handle, host);
        Ok(handle)
    }

    fn destroy_host(&mut self, host: HostHandle) {
        match self.hosts.remove(&host) {
            Some(mut h) => h.shutdown(),
            None => debug!("destroying unknown host {:?} - ignoring", host),
        }
    }

    async fn connect(&mut self, host: HostHandle, address: HostAddress, channel_count: u8, connect_data: Bytes) -> Result<PeerHandle, TransportError> {
        let prefer_ipv6 = self.host_mut(host)?.is_ipv6();
        let addr = Self::resolve(&address, prefer_ipv6).await?;
        debug!("resolved {} to {:?}", address, addr);

        // re-fetch: the host map is not borrowed across the await
        self.host_mut(host)?
            .connect(addr, channel_count, &connect_data)
    }

    fn disconnect(&mut self, peer: PeerHandle) -> Result<(), TransportError> {
        self.host_mut(peer.host)?
            .disconnect(peer)
    }

    fn send(&mut self, peer: PeerHandle, data: Bytes, channel: u8, flags: PacketFlags) -> Result<(), TransportError> {
        self.host_mut(peer.host)?
            .send(peer, &data, channel, flags)
    }

    async fn service(&mut self, host: HostHandle, timeout: Duration) -> Result<Option<TransportEvent>, TransportError> {
        self.host_mut(host)?
            .service(timeout)
            .await
    }

    fn local_addr(&self, host: HostHandle) -> Result<SocketAddr, TransportError> {
        self.check_initialized()?;
        self.hosts.get(&host)
            .ok_or(TransportError::UnknownHost(host))?
            .local_addr()
    }
}
