use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Environment variable carrying the identity tag of a supervisor.
pub const ENV_PMID: &str = "PM_PMID";

pub const PMID_BYTES: usize = 16;
pub const DEFAULT_KILL_TIMEOUT_MS: u64 = 5000;
pub const TAG_ALL: &str = "all";

// ---------------------------------------------------------------------------
// Pmid
// ---------------------------------------------------------------------------

/// Identifier of a logical managed process, independent of any OS pid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pmid(String);

impl Pmid {
    pub fn generate() -> Self {
        let bytes: [u8; PMID_BYTES] = rand::random();
        Self(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }

    /// Accepts only the canonical form: 32 lowercase hex digits.
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == PMID_BYTES * 2
            && s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        valid.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..6.min(self.0.len())]
    }
}

impl std::fmt::Display for Pmid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// StatusMarker
// ---------------------------------------------------------------------------

/// Last transition written by whoever caused it. Advisory only: liveness is
/// always re-derived from the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusMarker {
    Invalid,
    Created,
    Running,
    Stopped { exit_code: i32 },
}

impl std::fmt::Display for StatusMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusMarker::Invalid => write!(f, "invalid"),
            StatusMarker::Created => write!(f, "created"),
            StatusMarker::Running => write!(f, "running"),
            StatusMarker::Stopped { exit_code } => write!(f, "stopped({exit_code})"),
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessRecord
// ---------------------------------------------------------------------------

fn default_kill_timeout_ms() -> u64 {
    DEFAULT_KILL_TIMEOUT_MS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub id: Pmid,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: PathBuf,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub stdout_file: PathBuf,
    pub stderr_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch: Option<String>,
    #[serde(default)]
    pub max_restarts: u32,
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
    pub status: StatusMarker,
}

impl ProcessRecord {
    pub fn kill_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.kill_timeout_ms)
    }

    /// Same launch shape: every field the supervisor reads when it execs.
    pub fn same_launch_shape(&self, other: &ProcessRecord) -> bool {
        let mut ours = self.tags.clone();
        let mut theirs = other.tags.clone();
        ours.sort();
        ours.dedup();
        theirs.sort();
        theirs.dedup();

        self.command == other.command
            && self.args == other.args
            && self.cwd == other.cwd
            && self.env == other.env
            && self.watch == other.watch
            && self.max_restarts == other.max_restarts
            && self.kill_timeout_ms == other.kill_timeout_ms
            && ours == theirs
    }
}

/// Tags as stored: user tags plus `all`, deduplicated, order preserved.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len() + 1);
    for tag in tags.iter().map(String::as_str).chain([TAG_ALL]) {
        if !out.iter().any(|t| t == tag) {
            out.push(tag.to_string());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub names: Vec<String>,
    pub tags: Vec<String>,
    pub ids: Vec<Pmid>,
}

impl Filter {
    /// Selectors typed on the command line may be a name, a tag or an id.
    pub fn from_selectors(selectors: &[String]) -> Self {
        Self {
            names: selectors.to_vec(),
            tags: selectors.to_vec(),
            ids: selectors.iter().filter_map(|s| Pmid::parse(s)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.tags.is_empty() && self.ids.is_empty()
    }

    pub fn matches(&self, record: &ProcessRecord) -> bool {
        if self.is_empty() {
            return true;
        }
        self.names.contains(&record.name)
            || record.tags.iter().any(|t| self.tags.contains(t))
            || self.ids.contains(&record.id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> ProcessRecord {
        ProcessRecord {
            id: Pmid::generate(),
            name: name.to_string(),
            command: "/bin/sleep".to_string(),
            args: vec!["5".to_string()],
            cwd: PathBuf::from("/tmp"),
            env: BTreeMap::new(),
            tags: normalize_tags(&[]),
            stdout_file: PathBuf::from("/tmp/out"),
            stderr_file: PathBuf::from("/tmp/err"),
            watch: None,
            max_restarts: 0,
            kill_timeout_ms: DEFAULT_KILL_TIMEOUT_MS,
            status: StatusMarker::Created,
        }
    }

    #[test]
    fn test_generated_pmid_is_canonical() {
        let id = Pmid::generate();
        assert_eq!(id.as_str().len(), 32);
        assert_eq!(Pmid::parse(id.as_str()), Some(id.clone()));
    }

    #[test]
    fn test_generated_pmids_differ() {
        assert_ne!(Pmid::generate(), Pmid::generate());
    }

    #[test]
    fn test_parse_rejects_non_canonical() {
        assert!(Pmid::parse("web").is_none());
        assert!(Pmid::parse("0123456789ABCDEF0123456789abcdef").is_none());
        assert!(Pmid::parse("0123456789abcdef0123456789abcde").is_none());
        assert!(Pmid::parse("0123456789abcdef0123456789abcdeg").is_none());
    }

    #[test]
    fn test_status_marker_json_shape() {
        let json = serde_json::to_string(&StatusMarker::Stopped { exit_code: 3 }).unwrap();
        assert_eq!(json, r#"{"status":"stopped","exit_code":3}"#);
        let json = serde_json::to_string(&StatusMarker::Created).unwrap();
        assert_eq!(json, r#"{"status":"created"}"#);
    }

    #[test]
    fn test_record_defaults_when_fields_missing() {
        let json = format!(
            r#"{{"id":"{}","name":"x","command":"/bin/true","cwd":"/","stdout_file":"/o","stderr_file":"/e","status":{{"status":"created"}}}}"#,
            Pmid::generate()
        );
        let record: ProcessRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record.max_restarts, 0);
        assert_eq!(record.kill_timeout_ms, DEFAULT_KILL_TIMEOUT_MS);
        assert!(record.watch.is_none());
        assert!(record.args.is_empty());
    }

    #[test]
    fn test_normalize_tags_appends_all_once() {
        assert_eq!(normalize_tags(&[]), vec!["all"]);
        let tags = normalize_tags(&["web".into(), "all".into(), "web".into()]);
        assert_eq!(tags, vec!["web", "all"]);
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(Filter::default().matches(&record("web")));
    }

    #[test]
    fn test_filter_by_name_tag_and_id() {
        let mut web = record("web");
        web.tags = normalize_tags(&["frontend".into()]);
        let api = record("api");

        let by_name = Filter::from_selectors(&["web".into()]);
        assert!(by_name.matches(&web));
        assert!(!by_name.matches(&api));

        let by_tag = Filter::from_selectors(&["frontend".into()]);
        assert!(by_tag.matches(&web));
        assert!(!by_tag.matches(&api));

        let by_id = Filter::from_selectors(&[api.id.to_string()]);
        assert_eq!(by_id.ids, vec![api.id.clone()]);
        assert!(by_id.matches(&api));
        assert!(!by_id.matches(&web));
    }

    #[test]
    fn test_same_launch_shape_ignores_tag_order() {
        let mut a = record("web");
        let mut b = a.clone();
        a.tags = vec!["x".into(), "all".into()];
        b.tags = vec!["all".into(), "x".into()];
        assert!(a.same_launch_shape(&b));
        b.args.push("--verbose".into());
        assert!(!a.same_launch_shape(&b));
    }
}
