//! Backend unit lifecycle control.
//!
//! The backend is a systemd unit started and stopped through the manager's
//! D-Bus interface. Both calls use the `replace` job mode and are idempotent
//! on the systemd side.
//!
//! A mock implementation is provided for testing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::{debug, info};
use zbus::zvariant::OwnedObjectPath;
use zbus::{proxy, Connection};

use crate::error::{ActivatorError, Result};

/// Job mode passed to StartUnit/StopUnit.
pub const JOB_MODE_REPLACE: &str = "replace";

#[proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait SystemdManager {
    fn start_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;
    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;
}

/// Start/stop interface for the backend unit.
#[async_trait]
pub trait UnitControl: Send + Sync {
    /// Name of the controlled unit.
    fn unit_name(&self) -> &str;

    /// Bring the unit to running state.
    async fn start(&self) -> Result<()>;

    /// Bring the unit to stopped state.
    async fn stop(&self) -> Result<()>;
}

/// Controls a unit through the systemd manager on the system bus.
pub struct SystemdUnitController {
    manager: SystemdManagerProxy<'static>,
    unit: String,
}

impl SystemdUnitController {
    /// Connect to the system bus.
    pub async fn connect(unit: impl Into<String>) -> Result<Self> {
        let connection = Connection::system()
            .await
            .map_err(ActivatorError::BusConnect)?;
        Self::with_connection(&connection, unit).await
    }

    /// Build a controller on an existing bus connection.
    pub async fn with_connection(connection: &Connection, unit: impl Into<String>) -> Result<Self> {
        let manager = SystemdManagerProxy::new(connection)
            .await
            .map_err(ActivatorError::BusConnect)?;
        Ok(Self {
            manager,
            unit: unit.into(),
        })
    }
}

#[async_trait]
impl UnitControl for SystemdUnitController {
    fn unit_name(&self) -> &str {
        &self.unit
    }

    async fn start(&self) -> Result<()> {
        let job = self
            .manager
            .start_unit(&self.unit, JOB_MODE_REPLACE)
            .await
            .map_err(|source| ActivatorError::UnitStart {
                unit: self.unit.clone(),
                source,
            })?;
        info!(unit = %self.unit, job = %job.as_str(), "Start job queued");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let job = self
            .manager
            .stop_unit(&self.unit, JOB_MODE_REPLACE)
            .await
            .map_err(|source| ActivatorError::UnitStop {
                unit: self.unit.clone(),
                source,
            })?;
        info!(unit = %self.unit, job = %job.as_str(), "Stop job queued");
        Ok(())
    }
}

/// Mock controller for testing.
pub struct MockUnitController {
    unit: String,
    starts: AtomicU64,
    stops: AtomicU64,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
}

impl MockUnitController {
    /// Create a mock controller that accepts every call.
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            starts: AtomicU64::new(0),
            stops: AtomicU64::new(0),
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
        }
    }

    /// Make subsequent start calls fail.
    pub fn fail_starts(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    /// Make subsequent stop calls fail.
    pub fn fail_stops(&self) {
        self.fail_stop.store(true, Ordering::SeqCst);
    }

    /// Number of start calls made.
    pub fn start_count(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of stop calls made.
    pub fn stop_count(&self) -> u64 {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UnitControl for MockUnitController {
    fn unit_name(&self) -> &str {
        &self.unit
    }

    async fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ActivatorError::UnitStart {
                unit: self.unit.clone(),
                source: zbus::Error::Failure("mock configured to fail".to_string()),
            });
        }
        debug!(unit = %self.unit, "[MOCK] Unit started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(ActivatorError::UnitStop {
                unit: self.unit.clone(),
                source: zbus::Error::Failure("mock configured to fail".to_string()),
            });
        }
        debug!(unit = %self.unit, "[MOCK] Unit stopped");
        Ok(())
    }
}
