//! Datagram sources the engine can listen on

use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, Result};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// Source of beacon datagrams.
///
/// The engine owns one transport per run and drops it when the run ends, which
/// is what closes the underlying socket.
#[async_trait]
pub trait BeaconTransport: Send + Sync {
    /// Waits for the next datagram. Must be cancel safe: the engine races it
    /// against its stop signal and may drop the future at any await point.
    async fn recv_beacon(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Address the transport listens on
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// UDP socket bound to the discovery port and joined to the advertisement group
pub struct MulticastSocket {
    socket: UdpSocket,
    group: Ipv4Addr,
    interface: Ipv4Addr,
}

impl MulticastSocket {
    /// Binds `0.0.0.0:<port>` with address reuse and joins the multicast group.
    ///
    /// Address (and on unix, port) reuse lets several listeners share the
    /// port on one host. Must be called from within a tokio runtime.
    pub fn bind(config: &DiscoveryConfig) -> Result<Self> {
        let address = SocketAddr::V4(config.bind_address());
        let bind_error = |source: io::Error| DiscoveryError::Bind { address, source };

        let socket =
            Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_error)?;

        socket.set_reuse_address(true).map_err(bind_error)?;

        #[cfg(unix)]
        socket.set_reuse_port(true).map_err(bind_error)?;

        // Best effort, the OS default is fine for beacon-sized datagrams
        let _ = socket.set_recv_buffer_size(config.recv_buffer_size.max(64 * 1024));

        socket.set_nonblocking(true).map_err(bind_error)?;
        socket.bind(&address.into()).map_err(bind_error)?;

        socket
            .join_multicast_v4(&config.multicast_group, &config.interface)
            .map_err(|source| DiscoveryError::Join {
                group: config.multicast_group,
                interface: config.interface,
                source,
            })?;

        let socket = UdpSocket::from_std(socket.into()).map_err(bind_error)?;

        info!(
            address = %address,
            group = %config.multicast_group,
            interface = %config.interface,
            "Listening for device beacons"
        );

        Ok(Self {
            socket,
            group: config.multicast_group,
            interface: config.interface,
        })
    }
}

#[async_trait]
impl BeaconTransport for MulticastSocket {
    async fn recv_beacon(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Drop for MulticastSocket {
    fn drop(&mut self) {
        // The kernel drops the membership with the socket anyway; leaving first keeps it explicit
        let _ = self.socket.leave_multicast_v4(self.group, self.interface);
        debug!(group = %self.group, "Closed beacon socket");
    }
}
