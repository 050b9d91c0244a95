//! Accept loop over the inherited listening socket.
//!
//! For each accepted client the listener dials the backend (with bounded
//! retry) and spawns one relay per direction, then goes straight back to
//! accepting. Sessions are never awaited by the accept loop; they are reaped
//! opportunistically and drained on shutdown.
//!
//! ```text
//! ListenReady -> accept -> Connecting -> Retrying* -> Relaying
//!      ^                        |                        |
//!      +---- dial exhausted ----+------------------------+
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use super::backend::BackendDialer;
use super::relay::{relay, PairLatch, RelayOutcome};
use crate::activity::ActivitySender;

/// Statistics for the listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connection pairs currently relaying.
    pub connections_active: AtomicU64,
    /// Connection pairs fully closed.
    pub connections_closed: AtomicU64,
    /// Backend dials that succeeded.
    pub backend_connected: AtomicU64,
    /// Clients dropped because every backend dial failed.
    pub backend_failed: AtomicU64,
    /// Bytes relayed client -> backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed backend -> client.
    pub bytes_from_backend: AtomicU64,
}

impl ListenerStats {
    /// Log a one-line summary.
    pub fn log_summary(&self) {
        info!(
            accepted = self.connections_accepted.load(Ordering::Relaxed),
            active = self.connections_active.load(Ordering::Relaxed),
            closed = self.connections_closed.load(Ordering::Relaxed),
            backend_connected = self.backend_connected.load(Ordering::Relaxed),
            backend_failed = self.backend_failed.load(Ordering::Relaxed),
            bytes_to_backend = self.bytes_to_backend.load(Ordering::Relaxed),
            bytes_from_backend = self.bytes_from_backend.load(Ordering::Relaxed),
            "Listener statistics"
        );
    }
}

/// Why the accept loop stopped.
#[derive(Debug)]
pub enum ListenerExit {
    /// Shutdown was requested.
    Shutdown,
    /// `accept()` failed; the listener is unusable.
    AcceptFailed(io::Error),
}

/// Relay direction within a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ToBackend,
    FromBackend,
}

/// Marks a pair active for as long as either of its relays holds it.
struct PairGuard {
    stats: Arc<ListenerStats>,
}

impl PairGuard {
    fn new(stats: Arc<ListenerStats>) -> Arc<Self> {
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self { stats })
    }
}

impl Drop for PairGuard {
    fn drop(&mut self) {
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// In-flight relay tasks.
pub struct Sessions {
    relays: JoinSet<(Direction, RelayOutcome)>,
    stats: Arc<ListenerStats>,
}

impl Sessions {
    fn new(stats: Arc<ListenerStats>) -> Self {
        Self {
            relays: JoinSet::new(),
            stats,
        }
    }

    /// Number of relay tasks still tracked.
    pub fn len(&self) -> usize {
        self.relays.len()
    }

    /// Whether no relays are in flight.
    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    fn record(&self, joined: Result<(Direction, RelayOutcome), tokio::task::JoinError>) {
        match joined {
            Ok((direction, outcome)) => {
                let counter = match direction {
                    Direction::ToBackend => &self.stats.bytes_to_backend,
                    Direction::FromBackend => &self.stats.bytes_from_backend,
                };
                counter.fetch_add(outcome.bytes, Ordering::Relaxed);
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => error!(error = %e, "Relay task panicked"),
        }
    }

    /// Wait up to `limit` for relays to finish, then abort the rest.
    ///
    /// Returns the number of relays that were still running at the deadline.
    pub async fn drain(mut self, limit: Duration) -> usize {
        let waited = tokio::time::timeout(limit, async {
            while let Some(joined) = self.relays.join_next().await {
                self.record(joined);
            }
        })
        .await;

        if waited.is_err() {
            let remaining = self.relays.len();
            warn!(remaining, "Aborting relays still running after drain timeout");
            self.relays.abort_all();
            while self.relays.join_next().await.is_some() {}
            return remaining;
        }
        0
    }
}

/// Wait until a watch flag becomes true. A dropped sender counts as true.
async fn flag_set(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|set| *set).await;
}

/// Proxy listener on the inherited socket.
pub struct ProxyListener {
    /// The adopted listening socket.
    listener: TcpListener,
    /// Backend dialer.
    dialer: Arc<BackendDialer>,
    /// Activity channel shared with every relay.
    activity: ActivitySender,
    /// Emit activity before each accept attempt.
    accept_activity: bool,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl ProxyListener {
    /// Create a listener over an already-listening socket.
    pub fn new(listener: TcpListener, dialer: BackendDialer, activity: ActivitySender) -> Self {
        Self {
            listener,
            dialer: Arc::new(dialer),
            activity,
            accept_activity: true,
            stats: Arc::new(ListenerStats::default()),
        }
    }

    /// Set whether each accept attempt counts as activity.
    pub fn with_accept_activity(mut self, accept_activity: bool) -> Self {
        self.accept_activity = accept_activity;
        self
    }

    /// Get the local address of the listening socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Get the backend dialer.
    pub fn dialer(&self) -> Arc<BackendDialer> {
        Arc::clone(&self.dialer)
    }

    /// Accept and proxy connections until shutdown or an accept failure.
    ///
    /// In-flight sessions are handed back undrained; relays stop on their own
    /// once `shutdown` is set.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> (ListenerExit, Sessions) {
        let mut sessions = Sessions::new(Arc::clone(&self.stats));
        if let Ok(addr) = self.listener.local_addr() {
            info!(
                listen_addr = %addr,
                backend_addr = %self.dialer.address(),
                "Listener started"
            );
        }

        loop {
            if self.accept_activity {
                tokio::select! {
                    biased;
                    _ = flag_set(&mut shutdown) => return (ListenerExit::Shutdown, sessions),
                    _ = self.activity.emit() => {}
                }
            }

            let accepted = loop {
                tokio::select! {
                    biased;
                    _ = flag_set(&mut shutdown) => return (ListenerExit::Shutdown, sessions),
                    Some(joined) = sessions.relays.join_next(), if !sessions.is_empty() => {
                        sessions.record(joined);
                    }
                    accepted = self.listener.accept() => break accepted,
                }
            };

            let (inbound, peer_addr) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    return (ListenerExit::AcceptFailed(e), sessions);
                }
            };
            self.stats
                .connections_accepted
                .fetch_add(1, Ordering::Relaxed);

            let span = tracing::info_span!("connection", peer = %peer_addr);
            debug!(parent: &span, "Connection accepted");

            let dialed = tokio::select! {
                biased;
                _ = flag_set(&mut shutdown) => return (ListenerExit::Shutdown, sessions),
                dialed = self.dialer.dial().instrument(span.clone()) => dialed,
            };

            match dialed {
                Ok(backend) => {
                    self.stats.backend_connected.fetch_add(1, Ordering::Relaxed);
                    self.spawn_pair(&mut sessions, inbound, backend, &shutdown, span);
                }
                Err(e) => {
                    self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        parent: &span,
                        backend_addr = %self.dialer.address(),
                        error = %e,
                        "Backend unreachable, closing client connection"
                    );
                    close_abandoned(inbound).await;
                }
            }
        }
    }

    /// Spawn both relay directions for a connection pair.
    fn spawn_pair(
        &self,
        sessions: &mut Sessions,
        inbound: TcpStream,
        backend: TcpStream,
        shutdown: &watch::Receiver<bool>,
        span: tracing::Span,
    ) {
        let (client_read, client_write) = inbound.into_split();
        let (backend_read, backend_write) = backend.into_split();
        let latch = PairLatch::new();
        let guard = PairGuard::new(Arc::clone(&self.stats));

        let to_backend = {
            let guard = Arc::clone(&guard);
            let relay = relay(
                client_read,
                backend_write,
                self.activity.clone(),
                latch.clone(),
                shutdown.clone(),
            );
            async move {
                let outcome = relay.await;
                debug!(bytes = outcome.bytes, end = ?outcome.end, "Client -> backend closed");
                drop(guard);
                (Direction::ToBackend, outcome)
            }
        };

        let from_backend = {
            let relay = relay(
                backend_read,
                client_write,
                self.activity.clone(),
                latch,
                shutdown.clone(),
            );
            async move {
                let outcome = relay.await;
                debug!(bytes = outcome.bytes, end = ?outcome.end, "Backend -> client closed");
                drop(guard);
                (Direction::FromBackend, outcome)
            }
        };

        sessions.relays.spawn(to_backend.instrument(span.clone()));
        sessions.relays.spawn(from_backend.instrument(span));
    }
}

/// Close a client whose backend could not be reached.
async fn close_abandoned(mut inbound: TcpStream) {
    let _ = inbound.shutdown().await;
    drop(inbound);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn spawn_listener(
        backend: String,
        retries: u32,
        activity: ActivitySender,
    ) -> (
        SocketAddr,
        Arc<ListenerStats>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<(ListenerExit, Sessions)>,
    ) {
        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dialer = BackendDialer::new(backend, retries).with_retry_delay(Duration::from_millis(10));
        let listener = ProxyListener::new(socket, dialer, activity);
        let addr = listener.local_addr().unwrap();
        let stats = listener.stats();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(listener.run(rx));
        (addr, stats, tx, handle)
    }

    #[tokio::test]
    async fn test_ping_roundtrip() {
        let backend = echo_backend().await;
        let (addr, stats, _tx, _handle) =
            spawn_listener(backend.to_string(), 3, ActivitySender::disabled()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(stats.backend_connected.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_unreachable_backend_closes_client() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let (addr, stats, _tx, _handle) =
            spawn_listener(dead_addr.to_string(), 2, ActivitySender::disabled()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(stats.backend_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_accept_emits_activity() {
        let backend = echo_backend().await;
        let (sender, mut receiver) = activity::channel();
        let (_addr, _stats, _tx, _handle) = spawn_listener(backend.to_string(), 1, sender).await;

        // The first accept attempt is reported before any client connects.
        let got = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(()));
    }

    #[tokio::test]
    async fn test_accept_activity_disabled() {
        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (sender, mut receiver) = activity::channel();
        let listener = ProxyListener::new(socket, BackendDialer::new("127.0.0.1:1", 1), sender)
            .with_accept_activity(false);
        let (_tx, rx) = watch::channel(false);
        let _handle = tokio::spawn(listener.run(rx));

        let got = tokio::time::timeout(Duration::from_millis(200), receiver.recv()).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop_and_relays() {
        let backend = echo_backend().await;
        let (addr, stats, tx, handle) =
            spawn_listener(backend.to_string(), 1, ActivitySender::disabled()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();

        tx.send_replace(true);
        let (exit, sessions) = handle.await.unwrap();
        assert!(matches!(exit, ListenerExit::Shutdown));
        assert_eq!(sessions.drain(Duration::from_secs(1)).await, 0);
        assert_eq!(stats.connections_active.load(Ordering::Relaxed), 0);
        assert_eq!(stats.connections_closed.load(Ordering::Relaxed), 1);

        // Client sees the connection closed.
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_accept_error_ends_loop() {
        use nix::sys::socket::{shutdown, Shutdown};
        use std::os::fd::AsRawFd;

        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        shutdown(socket.as_raw_fd(), Shutdown::Both).unwrap();
        let dialer = BackendDialer::new("127.0.0.1:1", 1);
        let listener = ProxyListener::new(socket, dialer, ActivitySender::disabled());
        let (_tx, rx) = watch::channel(false);

        let (exit, sessions) = tokio::time::timeout(Duration::from_secs(2), listener.run(rx))
            .await
            .unwrap();
        assert!(matches!(exit, ListenerExit::AcceptFailed(_)));
        assert!(sessions.is_empty());
        assert_eq!(sessions.len(), 0);
    }
}
