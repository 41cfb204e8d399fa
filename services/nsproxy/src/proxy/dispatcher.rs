//! Accept loop and per-connection forwarding.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn, Instrument};

use super::relay::relay;
use crate::registry::BackendRegistry;

/// Dispatcher counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Connections accepted.
    pub accepted: AtomicU64,
    /// Connections closed because no backend was registered.
    pub no_backend: AtomicU64,
    /// Connections closed because the backend dial failed.
    pub dial_failed: AtomicU64,
    /// Connections relayed to a backend.
    pub relayed: AtomicU64,
    /// Connections currently being dialed or relayed.
    pub active: AtomicU64,
    /// Bytes relayed from clients to backends.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed from backends to clients.
    pub bytes_from_backend: AtomicU64,
}

/// Hands inbound connections to backends in round-robin order.
pub struct Dispatcher {
    listener: TcpListener,
    registry: Arc<BackendRegistry>,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    /// Create a dispatcher for an already bound listener.
    pub fn new(listener: TcpListener, registry: Arc<BackendRegistry>) -> Self {
        Self {
            listener,
            registry,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    /// Get the local address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get dispatcher statistics.
    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Accept connections until the listener fails.
    ///
    /// The backend is chosen here, in accept order; dialing and relaying run
    /// on a task per connection. Only errors that concern the listening
    /// socket itself are returned.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Dispatcher started");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_connection_error(&e) => {
                    warn!(error = %e, "Inbound connection failed during accept");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    return Err(e);
                }
            };

            self.stats.accepted.fetch_add(1, Ordering::Relaxed);

            let Some(backend) = self.registry.next().await else {
                self.stats.no_backend.fetch_add(1, Ordering::Relaxed);
                warn!(peer_addr = %peer_addr, "No backend available, closing connection");
                drop(stream);
                continue;
            };

            self.stats.active.fetch_add(1, Ordering::Relaxed);
            let stats = Arc::clone(&self.stats);
            let span = tracing::info_span!("connection", peer = %peer_addr, backend = %backend);

            tokio::spawn(
                async move {
                    forward(&stats, stream, &backend).await;
                    stats.active.fetch_sub(1, Ordering::Relaxed);
                }
                .instrument(span),
            );
        }
    }
}

/// Dial `backend` and relay `inbound` to it.
// TODO: bound the dial (and idle relay I/O) with configurable deadlines; a
// stalled backend currently pins this task and both sockets.
async fn forward(stats: &DispatchStats, inbound: TcpStream, backend: &str) {
    let outbound = match TcpStream::connect(backend).await {
        Ok(stream) => stream,
        Err(e) => {
            stats.dial_failed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Backend dial failed, closing connection");
            return;
        }
    };

    stats.relayed.fetch_add(1, Ordering::Relaxed);
    debug!("Connected to backend");

    let relayed = relay(inbound, outbound).await;

    stats
        .bytes_to_backend
        .fetch_add(relayed.to_backend, Ordering::Relaxed);
    stats
        .bytes_from_backend
        .fetch_add(relayed.from_backend, Ordering::Relaxed);

    debug!(
        bytes_to_backend = relayed.to_backend,
        bytes_from_backend = relayed.from_backend,
        ended_by = ?relayed.ended_by,
        "Connection closed"
    );
}

/// Accept failures caused by a single inbound connection rather than the
/// listening socket.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}
