//! UDP socket wrapper and receive loop.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Largest datagram the discovery protocol will emit or accept.
pub const MAX_DATAGRAM_SIZE: usize = 1280;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Binding the UDP socket failed.
    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),

    /// The socket is not open.
    #[error("socket closed")]
    Closed,
}

/// Receiver of raw datagrams from the socket.
///
/// The receive loop holds only a weak reference to the handler's owner and
/// exits once it is gone, so a handler never observes a datagram after its
/// owner started tearing down.
#[async_trait]
pub trait DatagramHandler: Send + Sync {
    /// Called for every datagram read from the socket.
    async fn on_datagram(&self, from: SocketAddr, data: Bytes);
}

/// Shared UDP socket for discovery traffic.
pub struct UdpTransport {
    bind_addr: SocketAddr,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Creates an unconnected transport for the given bind address.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            socket: RwLock::new(None),
            recv_task: Mutex::new(None),
        }
    }

    /// Binds the socket and starts the receive loop.
    pub async fn connect(&self, handler: Weak<dyn DatagramHandler>) -> Result<(), TransportError> {
        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .map_err(TransportError::Bind)?;
        let socket = Arc::new(socket);
        let local = socket.local_addr().map_err(TransportError::Bind)?;
        info!(addr = %local, "discovery socket bound");
        *self.socket.write() = Some(Arc::clone(&socket));

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        let Some(handler) = handler.upgrade() else {
                            break;
                        };
                        handler
                            .on_datagram(from, Bytes::copy_from_slice(&buf[..len]))
                            .await;
                    }
                    Err(e) => {
                        // Transient on most platforms (e.g. ICMP-driven
                        // errors surfaced on the socket).
                        debug!(error = %e, "udp receive failed");
                    }
                }
            }
        });
        *self.recv_task.lock() = Some(task);
        Ok(())
    }

    /// Closes the socket and stops the receive loop.
    pub fn disconnect(&self) {
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
        *self.socket.write() = None;
    }

    /// Returns true while the socket is bound.
    pub fn is_open(&self) -> bool {
        self.socket.read().is_some()
    }

    /// Sends a datagram, best-effort: failures are logged and dropped;
    /// the protocol's timers retry naturally.
    pub fn send(&self, to: SocketAddr, data: Bytes) {
        let socket = match self.socket.read().as_ref() {
            Some(socket) => Arc::clone(socket),
            None => {
                debug!(%to, "dropping send on closed socket");
                return;
            }
        };
        if let Err(e) = socket.try_send_to(&data, to) {
            debug!(%to, error = %e, "udp send failed");
        }
    }

    /// The bound local address, if open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket
            .read()
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    /// MTU hint for packet assembly.
    pub fn max_datagram_size(&self) -> usize {
        MAX_DATAGRAM_SIZE
    }
}
