//! Idle watchdog.
//!
//! Waits for activity signals and reports when a full window passes without
//! one. Every signal restarts the window at its full length. The watchdog only
//! reports expiry; stopping the unit and exiting is the coordinator's job.

use std::time::Duration;

use tokio::time::{timeout, Instant};
use tracing::{debug, info};

use crate::activity::ActivityReceiver;

/// Event reported by the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogEvent {
    /// No activity for at least `idle_for`.
    IdleTimeout { idle_for: Duration },
}

/// Idle-timeout monitor over an activity channel.
#[derive(Debug)]
pub struct IdleWatchdog {
    window: Duration,
    activity: ActivityReceiver,
}

impl IdleWatchdog {
    /// Create a watchdog with the given idle window.
    pub fn new(window: Duration, activity: ActivityReceiver) -> Self {
        Self { window, activity }
    }

    /// Monitor until a full window passes with no activity.
    pub async fn run(mut self) -> WatchdogEvent {
        info!(window = ?self.window, "Idle watchdog monitoring");

        let mut last_activity = Instant::now();
        let mut senders_open = true;

        loop {
            if !senders_open {
                // Nobody can signal anymore; wait out the current window.
                match last_activity.checked_add(self.window) {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
                break;
            }

            match timeout(self.window, self.activity.recv()).await {
                Ok(Some(())) => last_activity = Instant::now(),
                Ok(None) => {
                    debug!("All activity senders gone");
                    senders_open = false;
                }
                Err(_) => break,
            }
        }

        let idle_for = last_activity.elapsed();
        info!(idle_for = ?idle_for, "Idle timeout reached");
        WatchdogEvent::IdleTimeout { idle_for }
    }
}
