//! Byte-oriented TCP proxy.
//!
//! This module provides:
//! - The accept loop over the inherited socket
//! - Backend dialing with bounded retry
//! - Per-direction relays that report activity
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> BackendDialer -> Backend
//!              |
//!              +--> relay (client -> backend) --+
//!              +--> relay (backend -> client) --+--> activity channel
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{BackendDialer, ProxyListener};
//!
//! let dialer = BackendDialer::new("127.0.0.1:8080", 10);
//! let listener = ProxyListener::new(tcp_listener, dialer, activity);
//! let (exit, sessions) = listener.run(shutdown_rx).await;
//! ```

mod backend;
mod listener;
mod relay;

pub use backend::BackendDialer;
pub use listener::{ListenerExit, ListenerStats, ProxyListener, Sessions};
pub use relay::{relay, PairLatch, RelayEnd, RelayOutcome, RELAY_BUFFER_SIZE};
