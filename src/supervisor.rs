use crate::log::{LogWriter, SharedLogWriter, spawn_log_copier};
use crate::record::{ENV_PMID, ProcessRecord, StatusMarker};
use crate::store::Store;
use crate::sys::{self, ShutdownSignals, Termination};
use crate::watch::{WatchError, WatchTrigger};
use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a finished supervisor waits for the last output of its child to
/// reach the log files.
pub const COPIER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("cannot open log file {}: {source}", path.display())]
    LogOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot install signal handlers: {0}")]
    Signals(#[source] io::Error),
    #[error(transparent)]
    Terminate(#[from] sys::SignalError),
}

// ---------------------------------------------------------------------------
// ExecSpec
// ---------------------------------------------------------------------------

/// Everything needed to start the child. A `Command` is single-use once
/// spawned, so each launch builds a fresh one from this.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl ExecSpec {
    pub fn from_record(record: &ProcessRecord) -> Self {
        let mut env = record.env.clone();
        env.insert(ENV_PMID.to_string(), record.id.to_string());
        Self {
            program: record.command.clone(),
            args: record.args.clone(),
            cwd: record.cwd.clone(),
            env,
        }
    }

    /// The child leads a new process group so it can be signalled as a unit
    /// without reaching the supervisor.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.cwd)
            .envs(&self.env)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

/// Exit code as a shell would report it: 128 + signal for a killed child.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    pub launches: u32,
    pub triggers: u32,
    pub last_exit_code: Option<i32>,
}

enum Event {
    Exited(io::Result<ExitStatus>),
    Shutdown,
    Triggered(Vec<PathBuf>),
}

pub struct Supervisor {
    record: ProcessRecord,
    spec: ExecSpec,
    stdout: SharedLogWriter,
    stderr: SharedLogWriter,
    trigger: Option<WatchTrigger>,
    store: Option<Store>,
    copiers: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Opens the log targets and the watch subscription. Any failure here is
    /// fatal and marks the record invalid.
    pub async fn new(record: ProcessRecord, store: Option<Store>) -> Result<Self, SupervisorError> {
        match Self::init(&record).await {
            Ok((stdout, stderr, trigger)) => Ok(Self {
                spec: ExecSpec::from_record(&record),
                record,
                stdout,
                stderr,
                trigger,
                store,
                copiers: Vec::new(),
            }),
            Err(e) => {
                mark(store.as_ref(), &record, StatusMarker::Invalid);
                Err(e)
            }
        }
    }

    async fn init(
        record: &ProcessRecord,
    ) -> Result<(SharedLogWriter, SharedLogWriter, Option<WatchTrigger>), SupervisorError> {
        let open = |path: PathBuf| async move {
            LogWriter::open(&path)
                .await
                .map(LogWriter::shared)
                .map_err(|source| SupervisorError::LogOpen { path, source })
        };
        let stdout = open(record.stdout_file.clone()).await?;
        let stderr = open(record.stderr_file.clone()).await?;

        let trigger = match &record.watch {
            Some(pattern) => Some(WatchTrigger::new(&record.cwd, pattern)?),
            None => None,
        };
        Ok((stdout, stderr, trigger))
    }

    pub fn spec(&self) -> &ExecSpec {
        &self.spec
    }

    /// Runs until the child is done for good or SIGINT/SIGTERM arrives.
    pub async fn run(self) -> Result<SupervisorReport, SupervisorError> {
        let mut signals = ShutdownSignals::install().map_err(SupervisorError::Signals)?;
        self.run_until(async move { signals.recv().await }).await
    }

    /// Like [`Supervisor::run`] with a caller-supplied shutdown future. Output
    /// already read from the child is in the log files when this returns.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<SupervisorReport, SupervisorError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let result = self.supervise(shutdown).await;
        self.drain_copiers().await;
        result
    }

    async fn supervise<F>(
        &mut self,
        mut shutdown: Pin<&mut F>,
    ) -> Result<SupervisorReport, SupervisorError>
    where
        F: Future<Output = ()>,
    {
        let mut report = SupervisorReport::default();
        let mut restarts_left = self.record.max_restarts;
        let pmid = self.record.id.clone();

        loop {
            let mut child = match self.launch() {
                Ok(child) => child,
                Err(e) => {
                    error!(%pmid, error = %e, "launch failed");
                    mark(self.store.as_ref(), &self.record, StatusMarker::Invalid);
                    return Err(e);
                }
            };
            report.launches += 1;
            mark(self.store.as_ref(), &self.record, StatusMarker::Running);
            let Some(pgid) = child.id() else {
                return Err(SupervisorError::Launch {
                    program: self.spec.program.clone(),
                    source: io::Error::other("child reaped before its pid was read"),
                });
            };
            info!(%pmid, pid = pgid, launch = report.launches, "child started");

            let event = tokio::select! {
                status = child.wait() => Event::Exited(status),
                _ = shutdown.as_mut() => Event::Shutdown,
                batch = next_trigger(&mut self.trigger) => Event::Triggered(batch),
            };

            match event {
                Event::Shutdown => {
                    info!(%pmid, pgid, "shutdown requested, stopping child");
                    self.stop_child(pgid, &mut child, &mut report).await?;
                    return Ok(report);
                }
                Event::Triggered(batch) => {
                    report.triggers += 1;
                    info!(%pmid, pgid, changed = batch.len(), "watch triggered, restarting child");
                    self.stop_child(pgid, &mut child, &mut report).await?;
                    continue;
                }
                Event::Exited(status) => {
                    let code = match status {
                        Ok(status) => exit_code(status),
                        Err(e) => {
                            warn!(%pmid, error = %e, "cannot collect exit status");
                            -1
                        }
                    };
                    info!(%pmid, pid = pgid, code, "child exited");
                    report.last_exit_code = Some(code);
                    mark(
                        self.store.as_ref(),
                        &self.record,
                        StatusMarker::Stopped { exit_code: code },
                    );
                }
            }

            if restarts_left > 0 {
                restarts_left -= 1;
                debug!(%pmid, restarts_left, "restarting");
                continue;
            }
            if self.trigger.is_none() {
                return Ok(report);
            }

            debug!(%pmid, "restarts exhausted, waiting for watch trigger");
            tokio::select! {
                batch = next_trigger(&mut self.trigger) => {
                    report.triggers += 1;
                    info!(%pmid, changed = batch.len(), "watch triggered, relaunching");
                }
                _ = shutdown.as_mut() => return Ok(report),
            }
        }
    }

    fn launch(&mut self) -> Result<Child, SupervisorError> {
        let mut child = self
            .spec
            .command()
            .spawn()
            .map_err(|source| SupervisorError::Launch {
                program: self.spec.program.clone(),
                source,
            })?;

        self.copiers.retain(|copier| !copier.is_finished());
        if let Some(out) = child.stdout.take() {
            self.copiers.push(spawn_log_copier(out, self.stdout.clone()));
        }
        if let Some(err) = child.stderr.take() {
            self.copiers.push(spawn_log_copier(err, self.stderr.clone()));
        }
        Ok(child)
    }

    /// A grandchild that inherited the pipes can hold them open indefinitely,
    /// hence the bound.
    async fn drain_copiers(&mut self) {
        let copiers = std::mem::take(&mut self.copiers);
        let drained = tokio::time::timeout(COPIER_DRAIN_TIMEOUT, async {
            for copier in copiers {
                let _ = copier.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(pmid = %self.record.id, "log copiers still busy at exit");
        }
    }

    async fn stop_child(
        &self,
        pgid: u32,
        child: &mut Child,
        report: &mut SupervisorReport,
    ) -> Result<(), SupervisorError> {
        let outcome = sys::terminate_group(pgid, self.record.kill_timeout(), Some(&mut *child)).await?;
        if outcome == Termination::Killed {
            warn!(pmid = %self.record.id, pgid, "child killed after timeout");
        }
        let code = match child.try_wait() {
            Ok(Some(status)) => exit_code(status),
            _ => -1,
        };
        report.last_exit_code = Some(code);
        mark(
            self.store.as_ref(),
            &self.record,
            StatusMarker::Stopped { exit_code: code },
        );
        Ok(())
    }
}

/// Never resolves when there is no watch or the watcher is gone.
async fn next_trigger(trigger: &mut Option<WatchTrigger>) -> Vec<PathBuf> {
    if let Some(watch) = trigger {
        if let Some(batch) = watch.next_batch().await {
            return batch;
        }
        warn!("file watcher closed, no further triggers");
        *trigger = None;
    }
    std::future::pending().await
}

/// Best effort: a supervisor keeps running even if the store is unavailable.
fn mark(store: Option<&Store>, record: &ProcessRecord, status: StatusMarker) {
    let Some(store) = store else { return };
    if let Err(e) = store.set_status(&record.id, status) {
        warn!(pmid = %record.id, %status, error = %e, "cannot record status");
    }
}
