//! Socket-activated TCP proxy with on-demand unit lifecycle.
//!
//! systemd hands this process a listening socket. The first connection
//! starts a backend unit; traffic is relayed to it byte for byte; once the
//! proxy has been idle for the configured window the unit is stopped and
//! the process exits so systemd can reactivate it later.

pub mod activation;
pub mod activator;
pub mod activity;
pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod unit;
pub mod watchdog;

pub use activator::{Activator, Shutdown};
pub use activity::{ActivityReceiver, ActivitySender};
pub use config::Config;
pub use error::ActivatorError;
pub use proxy::{BackendDialer, ListenerExit, ListenerStats, ProxyListener, Sessions};
pub use unit::{MockUnitController, SystemdUnitController, UnitControl};
pub use watchdog::{IdleWatchdog, WatchdogEvent};
