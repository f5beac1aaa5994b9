use std::io;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::config::ListenerConfig;

/// Bound statsd UDP socket.
pub struct StatsdListener {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl StatsdListener {
    /// Binds the configured address and sizes the kernel receive buffer.
    ///
    /// A bind failure is returned to the caller; an unsupported receive
    /// buffer size is only logged since the OS default still works.
    pub async fn bind(cfg: &ListenerConfig) -> Result<Self> {
        let socket = UdpSocket::bind((cfg.address.as_str(), cfg.port))
            .await
            .with_context(|| format!("binding UDP listener on {}:{}", cfg.address, cfg.port))?;

        if let Some(size) = cfg.recv_buffer_size {
            set_recv_buffer_size(&socket, size);
        }

        let local_addr = socket
            .local_addr()
            .context("getting UDP listener address")?;

        info!(addr = %local_addr, "statsd listener bound");

        Ok(Self { socket, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Reads one datagram into `buf`, returning its length. Bytes past the
    /// end of `buf` are discarded by the kernel.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf).await
    }
}

fn set_recv_buffer_size(socket: &UdpSocket, size: usize) {
    let socket_ref = socket2::SockRef::from(socket);

    if let Err(e) = socket_ref.set_recv_buffer_size(size) {
        warn!(requested = size, error = %e, "failed to set UDP receive buffer size");
        return;
    }

    if let Ok(actual) = socket_ref.recv_buffer_size() {
        debug!(requested = size, actual, "UDP receive buffer configured");
    }
}
