//! systemd socket activation.
//!
//! systemd passes listening sockets starting at fd 3 and announces them with
//! `LISTEN_PID` (the pid they are meant for) and `LISTEN_FDS` (how many).
//! Discovery goes through `listenfd`; only the first socket is used.

use listenfd::ListenFd;
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::error::{ActivatorError, Result};

/// Verify this process was socket-activated and adopt the inherited listener.
///
/// Must be called from within a tokio runtime.
pub fn take_listener() -> Result<TcpListener> {
    // listenfd accepts a missing LISTEN_PID; systemd always sets it.
    if std::env::var_os("LISTEN_PID").is_none() {
        return Err(ActivatorError::NotSocketActivated);
    }
    take_first(&mut ListenFd::from_env())
}

/// Take the first passed descriptor as a TCP listener.
fn take_first(fds: &mut ListenFd) -> Result<TcpListener> {
    let count = fds.len();
    if count == 0 {
        return Err(ActivatorError::NotSocketActivated);
    }
    if count > 1 {
        warn!(
            listen_fds = count,
            "More than one socket passed; only fd 3 is proxied"
        );
    }

    let listener = fds
        .take_tcp_listener(0)
        .map_err(ActivatorError::InheritedSocket)?
        .ok_or(ActivatorError::NotSocketActivated)?;
    let listener = into_async(listener)?;
    debug!(fd = 3, "Adopted inherited listener");
    Ok(listener)
}

/// Check that `listener` is listening and register it with the runtime.
pub fn into_async(listener: std::net::TcpListener) -> Result<TcpListener> {
    ensure_listening(&listener)?;
    listener
        .set_nonblocking(true)
        .map_err(ActivatorError::InheritedSocket)?;
    TcpListener::from_std(listener).map_err(ActivatorError::InheritedSocket)
}

#[cfg(target_os = "linux")]
fn ensure_listening(listener: &std::net::TcpListener) -> Result<()> {
    use nix::sys::socket::{getsockopt, sockopt};

    let listening = getsockopt(listener, sockopt::AcceptConn)
        .map_err(|e| ActivatorError::InheritedSocket(e.into()))?;
    if !listening {
        return Err(ActivatorError::InheritedSocket(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "inherited socket is not listening",
        )));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn ensure_listening(_listener: &std::net::TcpListener) -> Result<()> {
    Ok(())
}
