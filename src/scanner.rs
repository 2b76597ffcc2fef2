use std::collections::HashMap;

/// One row of the process table, captured at scan time.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcEntry {
    pub pid: u32,
    pub ppid: Option<u32>,
    pub environ: HashMap<String, String>,
    /// Milliseconds since the Unix epoch.
    pub start_time_ms: u64,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

impl ProcEntry {
    pub fn env(&self, key: &str) -> Option<&str> {
        self.environ.get(key).map(String::as_str)
    }
}

/// The process forest at one instant. Matching is by explicit ppid links, so
/// order carries no meaning beyond being stable (ascending pid).
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: Vec<ProcEntry>,
}

impl Snapshot {
    pub fn from_entries(mut entries: Vec<ProcEntry>) -> Self {
        entries.sort_by_key(|e| e.pid);
        entries.dedup_by_key(|e| e.pid);
        Self { entries }
    }

    pub fn entries(&self) -> &[ProcEntry] {
        &self.entries
    }

    pub fn get(&self, pid: u32) -> Option<&ProcEntry> {
        self.entries
            .binary_search_by_key(&pid, |e| e.pid)
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn children_of(&self, pid: u32) -> impl Iterator<Item = &ProcEntry> {
        self.entries.iter().filter(move |e| e.ppid == Some(pid))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// CPU usage over the whole lifetime of a process, the way `ps` reports it.
pub fn lifetime_cpu_percent(cpu_ms: u64, start_time_ms: u64, now_ms: u64) -> f64 {
    let elapsed = now_ms.saturating_sub(start_time_ms);
    if elapsed == 0 {
        return 0.0;
    }
    cpu_ms as f64 / elapsed as f64 * 100.0
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

// ---------------------------------------------------------------------------
// Linux: /proc via procfs
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
pub fn scan() -> Snapshot {
    use procfs::process::all_processes;
    use tracing::{trace, warn};

    let procs = match all_processes() {
        Ok(procs) => procs,
        Err(e) => {
            warn!(error = %e, "cannot enumerate process table");
            return Snapshot::default();
        }
    };

    let ticks = procfs::ticks_per_second().max(1);
    let page_size = procfs::page_size();
    let boot_ms = match procfs::boot_time_secs() {
        Ok(secs) => secs * 1000,
        Err(e) => {
            warn!(error = %e, "cannot read boot time");
            0
        }
    };
    let now = now_ms();

    let mut entries = Vec::new();
    for process in procs {
        // Entries vanish mid-scan all the time; skip whatever cannot be read.
        let Ok(process) = process else { continue };
        let pid = process.pid();
        let (stat, environ) = match (process.stat(), process.environ()) {
            (Ok(stat), Ok(environ)) => (stat, environ),
            (Err(e), _) | (_, Err(e)) => {
                trace!(pid, error = %e, "skipping process");
                continue;
            }
        };

        let start_time_ms = boot_ms + stat.starttime * 1000 / ticks;
        let cpu_ms = (stat.utime + stat.stime) * 1000 / ticks;
        let environ = environ
            .into_iter()
            .map(|(k, v)| {
                (
                    k.to_string_lossy().into_owned(),
                    v.to_string_lossy().into_owned(),
                )
            })
            .collect();

        entries.push(ProcEntry {
            pid: pid as u32,
            ppid: (stat.ppid > 0).then_some(stat.ppid as u32),
            environ,
            start_time_ms,
            cpu_percent: lifetime_cpu_percent(cpu_ms, start_time_ms, now),
            memory_bytes: stat.rss * page_size,
        });
    }

    Snapshot::from_entries(entries)
}

#[cfg(not(target_os = "linux"))]
pub fn scan() -> Snapshot {
    tracing::warn!("process scanning is only supported on Linux");
    Snapshot::default()
}
