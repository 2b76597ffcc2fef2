use crate::discovery::{self, LiveProcessStat};
use crate::record::Pmid;
use crate::scanner::{self, Snapshot};
use crate::sys::{self, POLL_INTERVAL, Signal, SignalError};
use std::fmt;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Extra time a supervisor gets on top of its child's kill timeout to run the
/// termination protocol and exit.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no such running process: {0}")]
    NotRunning(Pmid),
    #[error(transparent)]
    Signal(#[from] SignalError),
}

// ---------------------------------------------------------------------------
// Batch results
// ---------------------------------------------------------------------------

/// One result per id; a failure for one id never stops the others.
#[derive(Debug)]
pub struct BatchOutcome<T, E> {
    pub results: Vec<(Pmid, Result<T, E>)>,
}

impl<T, E> Default for BatchOutcome<T, E> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
        }
    }
}

impl<T, E: fmt::Display> BatchOutcome<T, E> {
    pub fn push(&mut self, id: Pmid, result: Result<T, E>) {
        self.results.push((id, result));
    }

    pub fn failures(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_err()).count()
    }

    pub fn into_result(self) -> Result<Vec<(Pmid, T)>, BatchError> {
        let mut ok = Vec::new();
        let mut failed = Vec::new();
        for (id, result) in self.results {
            match result {
                Ok(value) => ok.push((id, value)),
                Err(e) => failed.push((id, e.to_string())),
            }
        }
        if failed.is_empty() {
            Ok(ok)
        } else {
            Err(BatchError { failed })
        }
    }
}

#[derive(Debug)]
pub struct BatchError {
    pub failed: Vec<(Pmid, String)>,
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} operation(s) failed", self.failed.len())?;
        for (id, err) in &self.failed {
            write!(f, "\n  {}: {err}", id.short())?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchError {}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// The supervisor runs the termination protocol on its child itself.
    Supervisor,
    /// Child group first, then the supervisor's own group.
    ChildAndSupervisor,
    Child,
}

pub fn route(signal: Signal) -> Route {
    match signal {
        Signal::SIGTERM | Signal::SIGINT => Route::Supervisor,
        Signal::SIGKILL => Route::ChildAndSupervisor,
        _ => Route::Child,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The signal targets the child and there is none right now.
    Skipped,
}

pub fn deliver(stat: &LiveProcessStat, signal: Signal) -> Result<Delivery, SignalError> {
    match (route(signal), stat.child_pid) {
        (Route::Supervisor, _) => {
            sys::signal_group(stat.supervisor_pid, signal)?;
        }
        (Route::ChildAndSupervisor, child) => {
            if let Some(child) = child {
                sys::signal_group(child, signal)?;
            }
            sys::signal_group(stat.supervisor_pid, signal)?;
        }
        (Route::Child, Some(child)) => {
            sys::signal_group(child, signal)?;
        }
        (Route::Child, None) => return Ok(Delivery::Skipped),
    }
    Ok(Delivery::Sent)
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Delivers `signal` to every id found in `snapshot`.
pub fn signal_with(
    snapshot: &Snapshot,
    ids: &[Pmid],
    signal: Signal,
) -> BatchOutcome<Delivery, DispatchError> {
    let mut outcome = BatchOutcome::default();
    for id in ids {
        let result = match discovery::find(snapshot, id) {
            None => Err(DispatchError::NotRunning(id.clone())),
            Some(stat) => {
                debug!(pmid = %id, supervisor = stat.supervisor_pid, %signal, "dispatching");
                deliver(&stat, signal).map_err(DispatchError::from)
            }
        };
        outcome.push(id.clone(), result);
    }
    outcome
}

pub fn signal(ids: &[Pmid], signal: Signal) -> BatchOutcome<Delivery, DispatchError> {
    signal_with(&scanner::scan(), ids, signal)
}

// ---------------------------------------------------------------------------
// Stop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyStopped,
    Stopped,
    Killed,
}

/// SIGTERM the supervisor, then watch the process table until its tag is
/// gone. Whatever is still around after `kill_timeout` + [`STOP_GRACE`] gets
/// SIGKILL.
pub async fn stop_one(id: Pmid, kill_timeout: Duration) -> Result<StopOutcome, DispatchError> {
    let Some(stat) = tokio::task::spawn_blocking({
        let id = id.clone();
        move || discovery::find(&scanner::scan(), &id)
    })
    .await
    .ok()
    .flatten() else {
        return Ok(StopOutcome::AlreadyStopped);
    };

    if !sys::signal_group(stat.supervisor_pid, Signal::SIGTERM)? {
        return Ok(StopOutcome::AlreadyStopped);
    }

    let deadline = tokio::time::Instant::now() + kill_timeout + STOP_GRACE;
    let mut last = stat;
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        let current = tokio::task::spawn_blocking({
            let id = id.clone();
            move || discovery::find(&scanner::scan(), &id)
        })
        .await
        .ok()
        .flatten();

        match current {
            None => {
                info!(pmid = %id, "stopped");
                return Ok(StopOutcome::Stopped);
            }
            Some(stat) => last = stat,
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
    }

    warn!(pmid = %id, supervisor = last.supervisor_pid, "supervisor did not stop in time, killing");
    deliver(&last, Signal::SIGKILL)?;
    Ok(StopOutcome::Killed)
}

pub async fn stop(targets: Vec<(Pmid, Duration)>) -> BatchOutcome<StopOutcome, DispatchError> {
    let mut set = JoinSet::new();
    for (index, (id, timeout)) in targets.iter().cloned().enumerate() {
        set.spawn(async move { (index, stop_one(id, timeout).await) });
    }

    let mut results: Vec<Option<Result<StopOutcome, DispatchError>>> =
        (0..targets.len()).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, result)) => results[index] = Some(result),
            Err(e) => warn!(error = %e, "stop task failed"),
        }
    }

    let mut outcome = BatchOutcome::default();
    for ((id, _), result) in targets.into_iter().zip(results) {
        let result = result.unwrap_or_else(|| Err(DispatchError::NotRunning(id.clone())));
        outcome.push(id, result);
    }
    outcome
}
