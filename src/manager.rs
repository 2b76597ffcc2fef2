use crate::config::{self, ConfigError, ProcessConfig};
use crate::discovery::{self, LiveProcessStat, LiveStatus};
use crate::dispatch::{self, BatchOutcome, Delivery, DispatchError, StopOutcome};
use crate::log::{self, LogFollower};
use crate::paths::{ENV_HOME, Paths};
use crate::record::{
    DEFAULT_KILL_TIMEOUT_MS, ENV_PMID, Filter, Pmid, ProcessRecord, StatusMarker, normalize_tags,
};
use crate::scanner::{self, Snapshot};
use crate::store::{Store, StoreError};
use crate::sys::Signal;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const FOLLOW_INTERVAL: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("no process matches {0}")]
    NoMatch(String),
    #[error("executable not found: {0:?}")]
    ExecutableNotFound(String),
    #[error("failed to spawn supervisor for {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot encode record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// A stored record joined with what the process table says right now.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessView {
    #[serde(flatten)]
    pub record: ProcessRecord,
    pub live: LiveStatus,
    pub stat: Option<LiveProcessStat>,
}

impl ProcessView {
    pub fn from_snapshot(record: ProcessRecord, snapshot: &Snapshot) -> Self {
        let stat = discovery::find(snapshot, &record.id);
        Self {
            live: discovery::derive_status(stat.as_ref()),
            record,
            stat,
        }
    }

    /// Seconds since the child started, if there is one.
    pub fn uptime_secs(&self, now_ms: u64) -> Option<u64> {
        let started = self.stat.as_ref()?.child_start_time?;
        Some(now_ms.saturating_sub(started) / 1000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { supervisor_pid: u32 },
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub name: String,
    pub stream: &'static str,
    pub line: String,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Works straight against the store and the process table; nothing here
/// outlives one command.
pub struct Manager {
    paths: Paths,
    store: Store,
    exe: PathBuf,
}

impl Manager {
    pub fn new(paths: Paths) -> Result<Self, ManagerError> {
        let exe = std::env::current_exe()?;
        Self::with_exe(paths, exe)
    }

    /// `exe` is the binary re-executed as `exe shim <record>`.
    pub fn with_exe(paths: Paths, exe: PathBuf) -> Result<Self, ManagerError> {
        let store = Store::open(paths.db_dir())?;
        std::fs::create_dir_all(paths.log_dir())?;
        Ok(Self { paths, store, exe })
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // -- records --

    /// Creates a record, or replaces an existing one with the same name while
    /// keeping its id and log files. The program and working directory are
    /// stored as absolute paths; nothing is stored if the program cannot be
    /// found.
    pub fn create(&self, config: ProcessConfig) -> Result<ProcessRecord, ManagerError> {
        let cwd = match config.cwd {
            Some(cwd) => std::path::absolute(cwd)?,
            None => std::env::current_dir()?,
        };
        let command = resolve_program(&config.command, &cwd)?;
        let existing = match &config.name {
            Some(name) => self.store.find_by_name(name)?,
            None => None,
        };

        let (id, stdout_file, stderr_file, status) = match &existing {
            Some(prev) => (
                prev.id.clone(),
                prev.stdout_file.clone(),
                prev.stderr_file.clone(),
                prev.status,
            ),
            None => {
                let id = Pmid::generate();
                let out = self.paths.stdout_log(&id);
                let err = self.paths.stderr_log(&id);
                (id, out, err, StatusMarker::Created)
            }
        };
        let name = config
            .name
            .unwrap_or_else(|| default_name(&command, &id));

        let record = ProcessRecord {
            id,
            name,
            command,
            args: config.args,
            cwd,
            env: config.env,
            tags: normalize_tags(&config.tags),
            stdout_file,
            stderr_file,
            watch: config.watch,
            max_restarts: config.max_restarts.unwrap_or(0),
            kill_timeout_ms: config.kill_timeout.unwrap_or(DEFAULT_KILL_TIMEOUT_MS),
            status,
        };
        if existing.as_ref().is_some_and(|prev| !prev.same_launch_shape(&record)) {
            info!(pmid = %record.id, name = %record.name, "launch settings changed, restart to apply");
        }
        self.store.put(&record)?;
        info!(pmid = %record.id, name = %record.name, "record saved");
        Ok(record)
    }

    pub fn create_from_file(&self, path: &Path) -> Result<Vec<ProcessRecord>, ManagerError> {
        config::load_config(path)?
            .into_iter()
            .map(|config| self.create(config))
            .collect()
    }

    /// Records matching the selectors; no selectors means every record.
    pub fn select(&self, selectors: &[String]) -> Result<Vec<ProcessRecord>, ManagerError> {
        let records = self.store.list(&Filter::from_selectors(selectors))?;
        if records.is_empty() && !selectors.is_empty() {
            return Err(ManagerError::NoMatch(selectors.join(", ")));
        }
        Ok(records)
    }

    // -- queries --

    pub fn list(&self, selectors: &[String]) -> Result<Vec<ProcessView>, ManagerError> {
        let records = self.select(selectors)?;
        let snapshot = scanner::scan();
        Ok(records
            .into_iter()
            .map(|record| ProcessView::from_snapshot(record, &snapshot))
            .collect())
    }

    // -- lifecycle --

    pub fn start(&self, records: &[ProcessRecord]) -> BatchOutcome<StartOutcome, ManagerError> {
        let snapshot = scanner::scan();
        let mut outcome = BatchOutcome::default();
        for record in records {
            let result = if discovery::find(&snapshot, &record.id).is_some() {
                debug!(pmid = %record.id, "already running");
                Ok(StartOutcome::AlreadyRunning)
            } else {
                self.spawn_supervisor(record)
                    .map(|supervisor_pid| StartOutcome::Started { supervisor_pid })
            };
            outcome.push(record.id.clone(), result);
        }
        outcome
    }

    fn spawn_supervisor(&self, record: &ProcessRecord) -> Result<u32, ManagerError> {
        let json = serde_json::to_string(record)?;
        let log_path = self.paths.supervisor_log(&record.id);
        let stderr = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let child = std::process::Command::new(&self.exe)
            .arg("shim")
            .arg(json)
            .env(ENV_PMID, record.id.as_str())
            .env(ENV_HOME, self.paths.home())
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr)
            .spawn()
            .map_err(|source| ManagerError::Spawn {
                name: record.name.clone(),
                source,
            })?;

        info!(pmid = %record.id, pid = child.id(), "supervisor spawned");
        Ok(child.id())
    }

    pub async fn stop(&self, records: &[ProcessRecord]) -> BatchOutcome<StopOutcome, DispatchError> {
        let targets = records
            .iter()
            .map(|r| (r.id.clone(), r.kill_timeout()))
            .collect();
        dispatch::stop(targets).await
    }

    pub async fn restart(
        &self,
        records: &[ProcessRecord],
    ) -> BatchOutcome<StartOutcome, ManagerError> {
        let stopped = self.stop(records).await;
        let mut ready = Vec::with_capacity(records.len());
        let mut outcome = BatchOutcome::default();
        for (record, (_, result)) in records.iter().zip(stopped.results) {
            match result {
                Ok(_) => ready.push(record.clone()),
                Err(e) => outcome.push(record.id.clone(), Err(e.into())),
            }
        }
        outcome.results.extend(self.start(&ready).results);
        outcome
    }

    /// Stops, forgets the record and removes its log files.
    pub async fn delete(&self, records: &[ProcessRecord]) -> BatchOutcome<(), ManagerError> {
        let stopped = self.stop(records).await;
        let mut outcome = BatchOutcome::default();
        for (record, (_, result)) in records.iter().zip(stopped.results) {
            let result = match result {
                Ok(_) => self.forget(&record.id),
                Err(e) => Err(e.into()),
            };
            outcome.push(record.id.clone(), result);
        }
        outcome
    }

    fn forget(&self, id: &Pmid) -> Result<(), ManagerError> {
        let record = self.store.delete(id)?;
        let files = log::all_log_files(&record.stdout_file)
            .into_iter()
            .chain(log::all_log_files(&record.stderr_file))
            .chain([self.paths.supervisor_log(id)]);
        for file in files {
            match std::fs::remove_file(&file) {
                Ok(()) => debug!(path = %file.display(), "removed log file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %file.display(), error = %e, "cannot remove log file"),
            }
        }
        Ok(())
    }

    pub fn signal(
        &self,
        records: &[ProcessRecord],
        signal: Signal,
    ) -> BatchOutcome<Delivery, DispatchError> {
        let ids: Vec<Pmid> = records.iter().map(|r| r.id.clone()).collect();
        dispatch::signal(&ids, signal)
    }

    // -- logs --

    fn log_targets(records: &[ProcessRecord]) -> Vec<(String, &'static str, PathBuf)> {
        records
            .iter()
            .flat_map(|r| {
                [
                    (r.name.clone(), "stdout", r.stdout_file.clone()),
                    (r.name.clone(), "stderr", r.stderr_file.clone()),
                ]
            })
            .collect()
    }

    pub fn tail(&self, records: &[ProcessRecord], lines: usize) -> Result<Vec<LogLine>, ManagerError> {
        let mut out = Vec::new();
        for (name, stream, path) in Self::log_targets(records) {
            for line in log::tail_file(&path, lines)? {
                out.push(LogLine {
                    name: name.clone(),
                    stream,
                    line,
                });
            }
        }
        Ok(out)
    }

    /// Polls every log file for new lines until `stop` resolves.
    pub async fn follow<F, S>(
        &self,
        records: &[ProcessRecord],
        mut on_line: F,
        stop: S,
    ) -> Result<(), ManagerError>
    where
        F: FnMut(LogLine),
        S: std::future::Future<Output = ()>,
    {
        let mut followers: Vec<(String, &'static str, LogFollower)> = Self::log_targets(records)
            .into_iter()
            .map(|(name, stream, path)| (name, stream, LogFollower::from_end(&path)))
            .collect();

        tokio::pin!(stop);
        loop {
            for (name, stream, follower) in &mut followers {
                for line in follower.poll_lines()? {
                    on_line(LogLine {
                        name: name.clone(),
                        stream: *stream,
                        line,
                    });
                }
            }
            tokio::select! {
                _ = &mut stop => return Ok(()),
                _ = tokio::time::sleep(FOLLOW_INTERVAL) => {}
            }
        }
    }
}

/// Looks `command` up like a shell would (a bare name goes through `PATH`),
/// then retries relative to `cwd`. The result is absolute but symlinks are
/// left alone.
pub fn resolve_program(command: &str, cwd: &Path) -> Result<String, ManagerError> {
    let given = Path::new(command);
    let found = if command.contains('/') {
        Some(given.to_path_buf()).filter(|p| is_executable(p))
    } else {
        find_in_path(command)
    };
    let found = found
        .or_else(|| {
            let local = cwd.join(given);
            (given.is_relative() && is_executable(&local)).then_some(local)
        })
        .ok_or_else(|| ManagerError::ExecutableNotFound(command.to_string()))?;

    let absolute = std::path::absolute(&found)?;
    debug!(command, resolved = %absolute.display(), "program resolved");
    Ok(absolute.to_string_lossy().into_owned())
}

fn find_in_path(program: &str) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

/// `<basename>-<short id>`, e.g. `sleep-3fa2c1`.
pub fn default_name(command: &str, id: &Pmid) -> String {
    let base = Path::new(command)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "proc".to_string());
    format!("{base}-{}", id.short())
}
