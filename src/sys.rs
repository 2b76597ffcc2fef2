use nix::errno::Errno;
use nix::sys::signal::killpg;
pub use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::str::FromStr;
use std::time::Duration;
use tokio::process::Child;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Signals a user may ask for by name or number.
pub const ACCEPTED_SIGNALS: [Signal; 9] = [
    Signal::SIGTERM,
    Signal::SIGKILL,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGQUIT,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGCONT,
    Signal::SIGSTOP,
];

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("invalid signal: {0}")]
    InvalidSignal(String),
    #[error("failed to send {signal} to process group {pgid}: {source}")]
    Delivery {
        pgid: u32,
        signal: Signal,
        #[source]
        source: Errno,
    },
    #[error("failed to probe process group {pgid}: {source}")]
    Probe {
        pgid: u32,
        #[source]
        source: Errno,
    },
}

// ---------------------------------------------------------------------------
// Signal parsing
// ---------------------------------------------------------------------------

/// Accepts `TERM`, `SIGTERM`, `sigterm` or `15`.
pub fn parse_signal(name: &str) -> Result<Signal, SignalError> {
    let invalid = || SignalError::InvalidSignal(name.to_string());
    let trimmed = name.trim();

    let signal = if let Ok(num) = trimmed.parse::<i32>() {
        Signal::try_from(num).map_err(|_| invalid())?
    } else {
        let upper = trimmed.to_ascii_uppercase();
        let normalized = if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{upper}")
        };
        Signal::from_str(&normalized).map_err(|_| invalid())?
    };

    if ACCEPTED_SIGNALS.contains(&signal) {
        Ok(signal)
    } else {
        Err(invalid())
    }
}

// ---------------------------------------------------------------------------
// Group delivery
// ---------------------------------------------------------------------------

fn group(pgid: u32) -> Pid {
    Pid::from_raw(pgid as i32)
}

/// Sends `signal` to every member of the group. Returns `false` when the group
/// no longer exists, which callers treat as success.
pub fn signal_group(pgid: u32, signal: Signal) -> Result<bool, SignalError> {
    match killpg(group(pgid), signal) {
        Ok(()) => {
            debug!(pgid, %signal, "signal delivered");
            Ok(true)
        }
        Err(Errno::ESRCH) => {
            debug!(pgid, %signal, "process group already gone");
            Ok(false)
        }
        Err(source) => Err(SignalError::Delivery {
            pgid,
            signal,
            source,
        }),
    }
}

/// Signal-0 liveness probe against the whole group.
pub fn group_alive(pgid: u32) -> Result<bool, SignalError> {
    match killpg(group(pgid), None) {
        Ok(()) | Err(Errno::EPERM) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(source) => Err(SignalError::Probe { pgid, source }),
    }
}

// ---------------------------------------------------------------------------
// Graceful termination
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Nothing was left to signal.
    AlreadyGone,
    /// The group exited after SIGTERM.
    Exited,
    /// The group outlived the timeout and was sent SIGKILL.
    Killed,
}

/// SIGTERM the group, poll until it is empty or `timeout` elapses, then
/// SIGKILL it. When the caller owns the group leader as a `Child` it is reaped
/// along the way; a zombie leader would otherwise keep the group alive.
pub async fn terminate_group(
    pgid: u32,
    timeout: Duration,
    mut child: Option<&mut Child>,
) -> Result<Termination, SignalError> {
    if !signal_group(pgid, Signal::SIGTERM)? {
        if let Some(child) = child {
            let _ = child.wait().await;
        }
        return Ok(Termination::AlreadyGone);
    }

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(child) = child.as_mut() {
            let _ = child.try_wait();
        }
        if !group_alive(pgid)? {
            return Ok(Termination::Exited);
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    warn!(pgid, timeout_ms = timeout.as_millis() as u64, "group ignored SIGTERM, sending SIGKILL");
    signal_group(pgid, Signal::SIGKILL)?;
    if let Some(child) = child {
        let _ = child.wait().await;
    }
    Ok(Termination::Killed)
}

// ---------------------------------------------------------------------------
// Shutdown signals
// ---------------------------------------------------------------------------

/// SIGINT/SIGTERM delivered to this process.
pub struct ShutdownSignals {
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    pub async fn recv(&mut self) {
        tokio::select! {
            _ = self.sigterm.recv() => {}
            _ = self.sigint.recv() => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
