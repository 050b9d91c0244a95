//! socket-activator
//!
//! Proxies connections from a systemd-passed socket to a backend service and
//! manages that service's unit:
//! - Verifies socket activation (`LISTEN_PID`) and adopts fd 3
//! - Starts the backend unit over D-Bus
//! - Relays each client to the backend address
//! - Stops the unit and exits after the configured inactivity timeout

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use socket_activator::{activation, logging, Activator, Config, Shutdown, SystemdUnitController};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    if let Err(e) = logging::init(&config.log_level, config.log_format) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::from(1);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        unit = %config.unit,
        backend_addr = %config.address,
        timeout = ?config.idle_timeout(),
        retries = config.retries,
        "socket-activator starting"
    );

    match run(config).await {
        Ok(Shutdown::IdleTimeout { idle_for }) => {
            info!(idle_for = ?idle_for, "Exiting after idle timeout");
            ExitCode::SUCCESS
        }
        Ok(Shutdown::Signal) => {
            info!("Exiting on signal");
            ExitCode::SUCCESS
        }
        Err(e) => {
            // Display already carries the source; one line per fatal error.
            error!(
                reason = e.reason_code(),
                unit_may_be_running = e.unit_may_be_running(),
                error = %e,
                "socket-activator failed"
            );
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> socket_activator::error::Result<Shutdown> {
    config.validate()?;

    let listener = activation::take_listener()?;
    let unit = SystemdUnitController::connect(config.unit.clone()).await?;

    Activator::new(config, Arc::new(unit)).run(listener).await
}
