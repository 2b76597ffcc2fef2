use crate::record::{ENV_PMID, Pmid};
use crate::scanner::{ProcEntry, Snapshot};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};

/// Live view of a managed process, rebuilt from the process table on every
/// query and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveProcessStat {
    pub supervisor_pid: u32,
    pub child_pid: Option<u32>,
    /// Milliseconds since the Unix epoch.
    pub child_start_time: Option<u64>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveStatus {
    Stopped,
    Created,
    Running,
}

impl std::fmt::Display for LiveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LiveStatus::Stopped => write!(f, "stopped"),
            LiveStatus::Created => write!(f, "created"),
            LiveStatus::Running => write!(f, "running"),
        }
    }
}

pub fn derive_status(stat: Option<&LiveProcessStat>) -> LiveStatus {
    match stat {
        None => LiveStatus::Stopped,
        Some(s) if s.child_pid.is_none() => LiveStatus::Created,
        Some(_) => LiveStatus::Running,
    }
}

fn is_tagged(entry: &ProcEntry, pmid: &Pmid) -> bool {
    entry.env(ENV_PMID) == Some(pmid.as_str())
}

/// The supervisor is the topmost process carrying the tag: whatever it execs
/// inherits the tag too, so a tagged parent means we are looking at a child.
pub fn find_supervisor<'a>(snapshot: &'a Snapshot, pmid: &Pmid) -> Option<&'a ProcEntry> {
    snapshot.entries().iter().find(|entry| {
        is_tagged(entry, pmid)
            && !entry
                .ppid
                .and_then(|ppid| snapshot.get(ppid))
                .is_some_and(|parent| is_tagged(parent, pmid))
    })
}

/// Breadth-first walk over ppid links, excluding `root` itself.
pub fn descendants(snapshot: &Snapshot, root: u32) -> Vec<&ProcEntry> {
    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    let mut out = Vec::new();

    while let Some(pid) = queue.pop_front() {
        for child in snapshot.children_of(pid) {
            if seen.insert(child.pid) {
                queue.push_back(child.pid);
                out.push(child);
            }
        }
    }
    out
}

pub fn find(snapshot: &Snapshot, pmid: &Pmid) -> Option<LiveProcessStat> {
    let supervisor = find_supervisor(snapshot, pmid)?;
    let subtree = descendants(snapshot, supervisor.pid);

    let oldest = subtree
        .iter()
        .min_by_key(|e| (e.start_time_ms, e.pid))
        .copied();

    Some(LiveProcessStat {
        supervisor_pid: supervisor.pid,
        child_pid: oldest.map(|e| e.pid),
        child_start_time: oldest.map(|e| e.start_time_ms),
        cpu_percent: subtree.iter().map(|e| e.cpu_percent).sum(),
        memory_bytes: subtree.iter().map(|e| e.memory_bytes).sum(),
    })
}
