//! Backend connection with bounded retry.
//!
//! The backend unit is usually still starting when the first client arrives,
//! so dialing retries a fixed number of times with a fixed delay between
//! failed attempts. Each attempt is bounded by a connect timeout.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{Config, DEFAULT_CONNECT_TIMEOUT, DEFAULT_RETRY_DELAY};

/// Dials the configured backend address.
#[derive(Debug)]
pub struct BackendDialer {
    /// Backend address (host:port), resolved per attempt.
    address: String,
    /// Maximum connection attempts per client.
    attempts: u32,
    /// Delay after each failed attempt.
    retry_delay: Duration,
    /// Bound on a single attempt.
    connect_timeout: Duration,
    /// Total attempts made.
    attempts_made: AtomicU64,
}

impl BackendDialer {
    /// Create a dialer with default delay and timeout.
    pub fn new(address: impl Into<String>, attempts: u32) -> Self {
        Self {
            address: address.into(),
            attempts: attempts.max(1),
            retry_delay: DEFAULT_RETRY_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            attempts_made: AtomicU64::new(0),
        }
    }

    /// Create a dialer from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.address.clone(), config.retries)
            .with_retry_delay(config.retry_delay)
            .with_connect_timeout(config.connect_timeout)
    }

    /// Set the delay after a failed attempt.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Set the per-attempt connect timeout.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Backend address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Total connection attempts made so far.
    pub fn attempts_made(&self) -> u64 {
        self.attempts_made.load(Ordering::Relaxed)
    }

    /// Connect to the backend, retrying up to the configured attempt count.
    ///
    /// Returns the last error once every attempt has failed.
    pub async fn dial(&self) -> io::Result<TcpStream> {
        let mut last_err = None;

        for attempt in 1..=self.attempts {
            match self.try_connect().await {
                Ok(stream) => {
                    debug!(
                        backend_addr = %self.address,
                        attempt,
                        "Connected to backend"
                    );
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(
                        backend_addr = %self.address,
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "Backend connection failed"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| io::Error::other("no connection attempts made")))
    }

    /// Attempt one connection.
    async fn try_connect(&self) -> io::Result<TcpStream> {
        self.attempts_made.fetch_add(1, Ordering::Relaxed);

        match timeout(self.connect_timeout, TcpStream::connect(self.address.as_str())).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
    }
}
