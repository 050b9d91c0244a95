//! One direction of a proxied connection.
//!
//! A relay copies bytes from a read half to a write half through a fixed
//! 1024-byte buffer, reporting activity on every successful read. The two
//! directions of a connection pair run as separate tasks and share only a
//! close latch: whichever relay ends first trips it, and the other stops at
//! its next await point so both sockets are released together.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::debug;

use crate::activity::ActivitySender;

/// Relay buffer size.
pub const RELAY_BUFFER_SIZE: usize = 1024;

/// Why a relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// Source closed cleanly.
    Eof,
    /// Reading from the source failed.
    ReadError,
    /// Writing to the destination failed.
    WriteError,
    /// The other direction of the pair closed.
    PeerClosed,
    /// Process shutdown.
    Shutdown,
}

/// Result of a finished relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    /// Bytes forwarded.
    pub bytes: u64,
    /// Why the relay stopped.
    pub end: RelayEnd,
}

/// Close latch shared by the two directions of a connection pair.
#[derive(Debug, Clone)]
pub struct PairLatch {
    tx: watch::Sender<bool>,
}

impl PairLatch {
    /// Create an open latch.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Mark the pair closed.
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the pair has been closed.
    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Subscribe to closure.
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for PairLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait until a watch flag becomes true. A dropped sender counts as true.
async fn flag_set(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|set| *set).await;
}

/// Relay bytes from `src` to `dst` until either side closes.
///
/// Any read or write failure ends the session for both directions. On exit the
/// destination is shut down for writing and both halves are dropped.
pub async fn relay<R, W>(
    mut src: R,
    mut dst: W,
    activity: ActivitySender,
    latch: PairLatch,
    mut shutdown: watch::Receiver<bool>,
) -> RelayOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; RELAY_BUFFER_SIZE];
    let mut closed = latch.subscribe();
    let mut bytes = 0u64;

    let end = loop {
        let n = tokio::select! {
            biased;
            _ = flag_set(&mut shutdown) => break RelayEnd::Shutdown,
            _ = flag_set(&mut closed) => break RelayEnd::PeerClosed,
            read = src.read(&mut buf) => match read {
                Ok(0) => break RelayEnd::Eof,
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "Relay read failed");
                    break RelayEnd::ReadError;
                }
            },
        };

        activity.emit().await;

        if let Err(e) = dst.write_all(&buf[..n]).await {
            debug!(error = %e, "Relay write failed");
            break RelayEnd::WriteError;
        }
        bytes += n as u64;
    };

    latch.close();
    let _ = dst.shutdown().await;

    RelayOutcome { bytes, end }
}
