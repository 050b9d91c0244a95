//! Activity signals.
//!
//! Relays and the listener report observed traffic as unit-valued events; the
//! idle watchdog consumes them to reset its window. The channel holds a single
//! slot, so a sender waits for the watchdog to drain the previous event.
//!
//! When idle monitoring is off there is no consumer, and senders are created
//! disabled so emitting never blocks.

use tokio::sync::mpsc;

/// Capacity of the activity channel.
const ACTIVITY_CHANNEL_CAPACITY: usize = 1;

/// Sending side of the activity channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ActivitySender {
    tx: Option<mpsc::Sender<()>>,
}

impl ActivitySender {
    /// A sender with no consumer; `emit` returns immediately.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Whether a consumer exists for this sender.
    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Report one activity event.
    ///
    /// Waits while the previous event is still unconsumed. A consumer that has
    /// gone away is ignored.
    pub async fn emit(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(()).await;
        }
    }
}

/// Receiving side of the activity channel.
#[derive(Debug)]
pub struct ActivityReceiver {
    rx: mpsc::Receiver<()>,
}

impl ActivityReceiver {
    /// Wait for the next event. Returns `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

/// Create a connected activity channel.
pub fn channel() -> (ActivitySender, ActivityReceiver) {
    let (tx, rx) = mpsc::channel(ACTIVITY_CHANNEL_CAPACITY);
    (ActivitySender { tx: Some(tx) }, ActivityReceiver { rx })
}
