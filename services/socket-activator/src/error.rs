//! Error types for the socket activator.

use std::io;

use thiserror::Error;

/// Activator errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum ActivatorError {
    /// `LISTEN_PID` is missing or names another process.
    #[error("seems not to be systemd-activated, aborting")]
    NotSocketActivated,

    /// The inherited descriptor could not be adopted as a listener.
    #[error("inherited_socket: {0}")]
    InheritedSocket(#[source] io::Error),

    /// Could not reach the systemd manager on the system bus.
    #[error("bus_connect_failed: {0}")]
    BusConnect(#[source] zbus::Error),

    /// StartUnit call failed.
    #[error("unit_start_failed: {unit}: {source}")]
    UnitStart {
        unit: String,
        #[source]
        source: zbus::Error,
    },

    /// StopUnit call failed; the backend may still be running.
    #[error("unit_stop_failed: {unit} may be left running: {source}")]
    UnitStop {
        unit: String,
        #[source]
        source: zbus::Error,
    },

    /// The accept loop ended and no idle watchdog is left to stop the unit.
    #[error("listener_closed: {0}")]
    ListenerClosed(#[source] io::Error),

    /// Invalid configuration.
    #[error("config_invalid: {0}")]
    Config(String),
}

impl ActivatorError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ActivatorError::NotSocketActivated => "not_socket_activated",
            ActivatorError::InheritedSocket(_) => "inherited_socket",
            ActivatorError::BusConnect(_) => "bus_connect_failed",
            ActivatorError::UnitStart { .. } => "unit_start_failed",
            ActivatorError::UnitStop { .. } => "unit_stop_failed",
            ActivatorError::ListenerClosed(_) => "listener_closed",
            ActivatorError::Config(_) => "config_invalid",
        }
    }

    /// Whether the backend unit may have been left running by this failure.
    pub fn unit_may_be_running(&self) -> bool {
        matches!(self, ActivatorError::UnitStop { .. })
    }
}

pub type Result<T> = std::result::Result<T, ActivatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_failure_reports_unit_left_running() {
        let err = ActivatorError::UnitStop {
            unit: "app.service".to_string(),
            source: zbus::Error::Failure("job failed".to_string()),
        };
        assert_eq!(err.reason_code(), "unit_stop_failed");
        assert!(err.unit_may_be_running());
        assert!(err.to_string().contains("app.service may be left running"));
    }

    #[test]
    fn test_not_activated_message() {
        let err = ActivatorError::NotSocketActivated;
        assert_eq!(err.to_string(), "seems not to be systemd-activated, aborting");
        assert!(!err.unit_may_be_running());
    }
}
