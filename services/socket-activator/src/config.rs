//! Activator configuration.
//!
//! Flags mirror the classic socket-activate tool (`-m`, `-u`, `-a`, `-t`, `-r`),
//! each with a `SOCKET_ACTIVATOR_*` environment fallback so unit files can set
//! them via `Environment=`.

use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};

use crate::error::{ActivatorError, Result};

/// Delay between failed backend connection attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Default bound on a single backend connection attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Maximum accepted unit name length.
const MAX_UNIT_NAME_LEN: usize = 256;

/// Proxy mode. Only plain TCP is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Tcp,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable single line, no timestamp (journald adds one).
    Compact,
    /// One JSON object per event.
    Json,
}

/// Socket activator configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "socket-activator")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Proxy mode.
    #[arg(short = 'm', long, env = "SOCKET_ACTIVATOR_MODE", value_enum, default_value = "tcp")]
    pub mode: Mode,

    /// Backend unit to start on activation and stop when idle.
    #[arg(short = 'u', long, env = "SOCKET_ACTIVATOR_UNIT", default_value = "null.service")]
    pub unit: String,

    /// Backend address (host:port).
    #[arg(short = 'a', long, env = "SOCKET_ACTIVATOR_ADDRESS", default_value = "127.0.0.1:80")]
    pub address: String,

    /// Inactivity timeout after which to stop the unit again (0 disables).
    #[arg(
        short = 't',
        long,
        env = "SOCKET_ACTIVATOR_TIMEOUT",
        value_parser = parse_duration,
        default_value = "0"
    )]
    pub timeout: Duration,

    /// Number of backend connection attempts before giving up on a client.
    #[arg(short = 'r', long, env = "SOCKET_ACTIVATOR_RETRIES", default_value_t = 10)]
    pub retries: u32,

    /// Delay between failed backend connection attempts.
    #[arg(long, env = "SOCKET_ACTIVATOR_RETRY_DELAY", value_parser = parse_duration, default_value = "100ms")]
    pub retry_delay: Duration,

    /// Bound on a single backend connection attempt.
    #[arg(long, env = "SOCKET_ACTIVATOR_CONNECT_TIMEOUT", value_parser = parse_duration, default_value = "2s")]
    pub connect_timeout: Duration,

    /// Count each accept attempt on the listener as activity.
    #[arg(
        long,
        env = "SOCKET_ACTIVATOR_ACCEPT_ACTIVITY",
        action = ArgAction::Set,
        default_value_t = true
    )]
    pub accept_activity: bool,

    /// Stop the unit when terminated by SIGTERM/SIGINT.
    #[arg(
        long,
        env = "SOCKET_ACTIVATOR_STOP_ON_SIGNAL",
        action = ArgAction::Set,
        default_value_t = true
    )]
    pub stop_on_signal: bool,

    /// How long to wait for in-flight connections to close on shutdown.
    #[arg(long, env = "SOCKET_ACTIVATOR_DRAIN_TIMEOUT", value_parser = parse_duration, default_value = "2s")]
    pub drain_timeout: Duration,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "SOCKET_ACTIVATOR_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "SOCKET_ACTIVATOR_LOG_FORMAT", value_enum, default_value = "compact")]
    pub log_format: LogFormat,
}

impl Config {
    /// Build a configuration for the given unit and backend with defaults elsewhere.
    pub fn new(unit: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            mode: Mode::Tcp,
            unit: unit.into(),
            address: address.into(),
            timeout: Duration::ZERO,
            retries: 10,
            retry_delay: DEFAULT_RETRY_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            accept_activity: true,
            stop_on_signal: true,
            drain_timeout: Duration::from_secs(2),
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
        }
    }

    /// The idle window, if monitoring is enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }

    /// Check values clap cannot check on its own.
    pub fn validate(&self) -> Result<()> {
        if self.retries == 0 {
            return Err(ActivatorError::Config(
                "retries must be at least 1".to_string(),
            ));
        }
        validate_unit_name(&self.unit)?;
        validate_address(&self.address)?;
        Ok(())
    }
}

/// Validate a systemd unit name.
pub fn validate_unit_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ActivatorError::Config("unit name cannot be empty".to_string()));
    }
    if name.len() > MAX_UNIT_NAME_LEN {
        return Err(ActivatorError::Config(format!(
            "unit name too long (max {} chars)",
            MAX_UNIT_NAME_LEN
        )));
    }
    // systemd unit name charset, including `\x2d`-style escapes
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "@._-:\\".contains(c))
    {
        return Err(ActivatorError::Config(format!(
            "unit name contains invalid characters: {}",
            name
        )));
    }
    Ok(())
}

/// Validate a `host:port` backend address without resolving it.
pub fn validate_address(address: &str) -> Result<()> {
    let (host, port) = address.rsplit_once(':').ok_or_else(|| {
        ActivatorError::Config(format!("address {:?} is not host:port", address))
    })?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ActivatorError::Config(format!(
            "address {:?} has an empty host",
            address
        )));
    }
    port.parse::<u16>().map_err(|_| {
        ActivatorError::Config(format!("address {:?} has an invalid port", address))
    })?;
    Ok(())
}

/// Parse a duration such as `90s`, `5m`, `1h30m`, `250ms` or `1.5s`.
///
/// A bare number is taken as seconds.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration {:?}", input))?;
        if num_len == 0 {
            return Err(format!("invalid duration {:?}", input));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| format!("invalid number in duration {:?}", input))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            other => return Err(format!("unknown unit {:?} in duration {:?}", other, input)),
        };
        rest = &rest[unit_len..];
        let part = Duration::try_from_secs_f64(value * scale)
            .map_err(|_| format!("duration {:?} is out of range", input))?;
        total = total
            .checked_add(part)
            .ok_or_else(|| format!("duration {:?} is out of range", input))?;
    }
    Ok(total)
}
