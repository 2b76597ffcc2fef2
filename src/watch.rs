use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEBOUNCE_DURATION: Duration = Duration::from_millis(500);
const CHANNEL_CAPACITY: usize = 256;
const BATCH_CAPACITY: usize = 16;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("invalid watch pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("cannot watch {}: {source}", root.display())]
    Notify {
        root: PathBuf,
        #[source]
        source: notify::Error,
    },
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PathMatcher {
    root: PathBuf,
    pattern: Regex,
}

impl PathMatcher {
    fn is_relevant(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let in_git = relative
            .components()
            .any(|c| matches!(c, Component::Normal(name) if name == ".git"));
        !in_git && self.pattern.is_match(&relative.to_string_lossy())
    }

    fn relevant_paths(&self, event: &notify::Event) -> Vec<PathBuf> {
        if matches!(event.kind, EventKind::Access(_)) {
            return Vec::new();
        }
        event
            .paths
            .iter()
            .filter(|p| self.is_relevant(p))
            .cloned()
            .collect()
    }
}

/// Waits for the first relevant change, keeps collecting for
/// [`DEBOUNCE_DURATION`], then hands the finished batch over. Ends when the
/// watcher or the trigger goes away.
async fn run_batcher(
    matcher: PathMatcher,
    mut events: mpsc::Receiver<notify::Event>,
    batches: mpsc::Sender<Vec<PathBuf>>,
) {
    while let Some(first) = events.recv().await {
        let mut batch = matcher.relevant_paths(&first);
        if batch.is_empty() {
            continue;
        }

        let window = tokio::time::sleep(DEBOUNCE_DURATION);
        tokio::pin!(window);
        let mut closed = false;
        loop {
            tokio::select! {
                _ = &mut window => break,
                event = events.recv() => match event {
                    Some(event) => batch.extend(matcher.relevant_paths(&event)),
                    None => {
                        closed = true;
                        break;
                    }
                },
            }
        }

        batch.sort();
        batch.dedup();
        debug!(changed = batch.len(), "watch batch ready");
        if batches.send(batch).await.is_err() || closed {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// Batches of changed paths under `root` whose relative path matches a regex.
/// Batching runs in its own task, so a batch that is ready stays queued until
/// [`WatchTrigger::next_batch`] picks it up. Dropping the trigger stops the
/// underlying watcher.
pub struct WatchTrigger {
    matcher: PathMatcher,
    batches: mpsc::Receiver<Vec<PathBuf>>,
    _watcher: RecommendedWatcher,
}

impl WatchTrigger {
    /// Must be called inside a tokio runtime.
    pub fn new(root: &Path, pattern: &str) -> Result<Self, WatchError> {
        let pattern_re = Regex::new(pattern).map_err(|source| WatchError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        let notify_err = |source| WatchError::Notify {
            root: root.to_path_buf(),
            source,
        };

        // Events arrive with the watched path as prefix; watch the canonical
        // form so stripping it back off works through symlinks.
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());

        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let _ = event_tx.blocking_send(event);
                }
                Err(e) => warn!(error = %e, "file watcher error"),
            }
        })
        .map_err(notify_err)?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(notify_err)?;

        debug!(root = %root.display(), pattern, "watching");
        let matcher = PathMatcher {
            root,
            pattern: pattern_re,
        };
        let (batch_tx, batch_rx) = mpsc::channel(BATCH_CAPACITY);
        tokio::spawn(run_batcher(matcher.clone(), event_rx, batch_tx));

        Ok(Self {
            matcher,
            batches: batch_rx,
            _watcher: watcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.matcher.root
    }

    pub fn is_relevant(&self, path: &Path) -> bool {
        self.matcher.is_relevant(path)
    }

    /// Next finished batch; `None` once the watcher has shut down. Cancel
    /// safe: dropping the future loses nothing.
    pub async fn next_batch(&mut self) -> Option<Vec<PathBuf>> {
        self.batches.recv().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
