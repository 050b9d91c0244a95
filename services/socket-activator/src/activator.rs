//! Activation coordinator.
//!
//! Owns the process lifecycle: starts the backend unit, runs the proxy
//! listener alongside the idle watchdog, and on idle expiry (or a termination
//! signal) stops the unit before shutting the proxy down in order.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::activity::{self, ActivitySender};
use crate::config::Config;
use crate::error::{ActivatorError, Result};
use crate::proxy::{BackendDialer, ListenerExit, ProxyListener, Sessions};
use crate::unit::UnitControl;
use crate::watchdog::{IdleWatchdog, WatchdogEvent};

/// How the activator finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// No activity for the configured window; the unit was stopped.
    IdleTimeout { idle_for: Duration },
    /// SIGTERM or SIGINT.
    Signal,
}

/// What ended the main wait.
enum Trigger {
    Idle(WatchdogEvent),
    Signal,
}

/// Central coordinator for one activation.
pub struct Activator {
    config: Config,
    unit: Arc<dyn UnitControl>,
}

impl Activator {
    /// Create a coordinator for the given configuration and unit controller.
    pub fn new(config: Config, unit: Arc<dyn UnitControl>) -> Self {
        Self { config, unit }
    }

    /// Run until idle timeout or SIGTERM/SIGINT.
    pub async fn run(self, listener: TcpListener) -> Result<Shutdown> {
        self.run_until(listener, shutdown_signal()).await
    }

    /// Run until idle timeout or until `signal` completes.
    pub async fn run_until<F>(self, socket: TcpListener, signal: F) -> Result<Shutdown>
    where
        F: Future<Output = ()>,
    {
        let unit_name = self.unit.unit_name().to_string();
        info!(unit = %unit_name, "Starting backend unit");
        self.unit.start().await?;

        let (activity, watchdog) = match self.config.idle_timeout() {
            Some(window) => {
                let (tx, rx) = activity::channel();
                (tx, Some(IdleWatchdog::new(window, rx)))
            }
            None => {
                info!("No idle timeout configured, unit will not be stopped on inactivity");
                (ActivitySender::disabled(), None)
            }
        };
        let monitored = watchdog.is_some();

        let listener = ProxyListener::new(socket, BackendDialer::from_config(&self.config), activity)
            .with_accept_activity(self.config.accept_activity);
        let stats = listener.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut listener_task = tokio::spawn(listener.run(shutdown_rx));

        let idle = async move {
            match watchdog {
                Some(watchdog) => watchdog.run().await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(idle);
        tokio::pin!(signal);

        let mut sessions: Option<Sessions> = None;
        let mut listener_done = false;

        let trigger = loop {
            tokio::select! {
                event = &mut idle => break Trigger::Idle(event),
                _ = &mut signal => break Trigger::Signal,
                joined = &mut listener_task, if !listener_done => {
                    listener_done = true;
                    let accept_error = match joined {
                        Ok((ListenerExit::AcceptFailed(e), remaining)) => {
                            sessions = Some(remaining);
                            e
                        }
                        Ok((ListenerExit::Shutdown, remaining)) => {
                            sessions = Some(remaining);
                            continue;
                        }
                        Err(e) => {
                            error!(error = %e, "Listener task failed");
                            std::io::Error::other(e)
                        }
                    };

                    if !monitored {
                        let _ = shutdown_tx.send(true);
                        if let Some(remaining) = sessions.take() {
                            debug!(relays = remaining.len(), "Draining relays");
                            remaining.drain(self.config.drain_timeout).await;
                        }
                        stats.log_summary();
                        return Err(ActivatorError::ListenerClosed(accept_error));
                    }
                    warn!(
                        error = %accept_error,
                        "Listener stopped accepting; waiting for idle timeout to stop the unit"
                    );
                }
            }
        };

        let (outcome, stop_result) = match trigger {
            Trigger::Idle(WatchdogEvent::IdleTimeout { idle_for }) => {
                info!(unit = %unit_name, idle_for = ?idle_for, "Idle timeout, stopping backend unit");
                (Shutdown::IdleTimeout { idle_for }, self.unit.stop().await)
            }
            Trigger::Signal if self.config.stop_on_signal => {
                info!(unit = %unit_name, "Received shutdown signal, stopping backend unit");
                (Shutdown::Signal, self.unit.stop().await)
            }
            Trigger::Signal => {
                info!("Received shutdown signal, leaving backend unit running");
                (Shutdown::Signal, Ok(()))
            }
        };

        // Orderly teardown: stop accepting, close relays, wait briefly.
        let _ = shutdown_tx.send(true);
        if !listener_done {
            match listener_task.await {
                Ok((_, remaining)) => sessions = Some(remaining),
                Err(e) => error!(error = %e, "Listener task failed"),
            }
        }
        if let Some(remaining) = sessions {
            debug!(relays = remaining.len(), "Draining relays");
            remaining.drain(self.config.drain_timeout).await;
        }
        stats.log_summary();

        stop_result?;
        Ok(outcome)
    }
}

/// Wait for SIGTERM (systemd stop) or SIGINT.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "Cannot listen for SIGTERM"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Cannot listen for SIGINT");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::MockUnitController;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn socket() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").await.unwrap()
    }

    fn config(timeout: Duration) -> Config {
        let mut config = Config::new("app.service", "127.0.0.1:1");
        config.timeout = timeout;
        config.retries = 1;
        config.retry_delay = Duration::from_millis(10);
        config.drain_timeout = Duration::from_millis(200);
        config
    }

    #[tokio::test]
    async fn test_idle_timeout_stops_unit_once() {
        let unit = Arc::new(MockUnitController::new("app.service"));
        let activator = Activator::new(config(Duration::from_millis(300)), unit.clone());

        let outcome = activator
            .run_until(socket().await, std::future::pending())
            .await
            .unwrap();

        assert!(matches!(outcome, Shutdown::IdleTimeout { .. }));
        assert_eq!(unit.start_count(), 1);
        assert_eq!(unit.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_is_fatal() {
        let unit = Arc::new(MockUnitController::new("app.service"));
        unit.fail_starts();
        let activator = Activator::new(config(Duration::from_millis(300)), unit.clone());

        let result = activator
            .run_until(socket().await, std::future::pending())
            .await;

        assert!(matches!(result, Err(ActivatorError::UnitStart { .. })));
        assert_eq!(unit.stop_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_failure_reported() {
        let unit = Arc::new(MockUnitController::new("app.service"));
        unit.fail_stops();
        let activator = Activator::new(config(Duration::from_millis(200)), unit.clone());

        let result = activator
            .run_until(socket().await, std::future::pending())
            .await;

        let err = result.unwrap_err();
        assert!(err.unit_may_be_running());
        assert_eq!(unit.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_no_timeout_never_stops() {
        let unit = Arc::new(MockUnitController::new("app.service"));
        let mut cfg = config(Duration::ZERO);
        cfg.stop_on_signal = false;
        let activator = Activator::new(cfg, unit.clone());

        let outcome = activator
            .run_until(socket().await, tokio::time::sleep(Duration::from_millis(500)))
            .await
            .unwrap();

        assert_eq!(outcome, Shutdown::Signal);
        assert_eq!(unit.stop_count(), 0);
    }

    #[tokio::test]
    async fn test_signal_stops_unit() {
        let unit = Arc::new(MockUnitController::new("app.service"));
        let activator = Activator::new(config(Duration::ZERO), unit.clone());

        let outcome = activator
            .run_until(socket().await, tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap();

        assert_eq!(outcome, Shutdown::Signal);
        assert_eq!(unit.stop_count(), 1);
    }

    /// A bound socket whose `accept()` fails with EINVAL.
    #[cfg(target_os = "linux")]
    async fn broken_socket() -> TcpListener {
        use nix::sys::socket::{shutdown, Shutdown as How};
        use std::os::fd::AsRawFd;

        let listener = socket().await;
        shutdown(listener.as_raw_fd(), How::Both).unwrap();
        listener
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_accept_failure_without_timeout_is_fatal() {
        let unit = Arc::new(MockUnitController::new("app.service"));
        let activator = Activator::new(config(Duration::ZERO), unit.clone());

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            activator.run_until(broken_socket().await, std::future::pending()),
        )
        .await
        .unwrap();

        let err = result.unwrap_err();
        assert!(matches!(err, ActivatorError::ListenerClosed(_)));
        assert_eq!(err.reason_code(), "listener_closed");
        assert_eq!(unit.start_count(), 1);
        assert_eq!(unit.stop_count(), 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_accept_failure_with_timeout_waits_for_idle_stop() {
        let unit = Arc::new(MockUnitController::new("app.service"));
        let activator = Activator::new(config(Duration::from_millis(300)), unit.clone());
        let started = tokio::time::Instant::now();

        let outcome = activator
            .run_until(broken_socket().await, std::future::pending())
            .await
            .unwrap();

        assert!(matches!(outcome, Shutdown::IdleTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(unit.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_traffic_defers_idle_timeout() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = backend.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });

        let mut cfg = config(Duration::from_millis(400));
        cfg.address = backend_addr.to_string();
        let unit = Arc::new(MockUnitController::new("app.service"));
        let proxy = socket().await;
        let proxy_addr = proxy.local_addr().unwrap();

        let started = tokio::time::Instant::now();
        let run = tokio::spawn(Activator::new(cfg, unit.clone()).run_until(proxy, std::future::pending()));

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        for _ in 0..6 {
            client.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert_eq!(unit.stop_count(), 0);
        drop(client);

        let outcome = run.await.unwrap().unwrap();
        assert!(matches!(outcome, Shutdown::IdleTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(1600));
        assert_eq!(unit.stop_count(), 1);
    }
}
