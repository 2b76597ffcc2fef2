use crate::record::{Filter, Pmid, ProcessRecord, StatusMarker};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("process not found: {0}")]
    NotFound(Pmid),
    #[error("store io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One JSON file per record, keyed by pmid.
#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn open(dir: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &Pmid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn read(path: &Path) -> Result<ProcessRecord, StoreError> {
        let bytes = fs::read(path).map_err(io_err(path))?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn get(&self, id: &Pmid) -> Result<Option<ProcessRecord>, StoreError> {
        let path = self.record_path(id);
        match Self::read(&path) {
            Ok(record) => Ok(Some(record)),
            Err(StoreError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn list(&self, filter: &Filter) -> Result<Vec<ProcessRecord>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(io_err(&self.dir))?;

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&self.dir))?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match Self::read(&path) {
                Ok(record) if filter.matches(&record) => records.push(record),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }

        records.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    pub fn find_by_name(&self, name: &str) -> Result<Option<ProcessRecord>, StoreError> {
        Ok(self
            .list(&Filter::default())?
            .into_iter()
            .find(|r| r.name == name))
    }

    /// Writes through a temp file so readers never observe a partial record.
    pub fn put(&self, record: &ProcessRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.id);
        let tmp = self.dir.join(format!(".{}.json.tmp", record.id));
        let bytes = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        fs::write(&tmp, bytes).map_err(io_err(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_err(&path))?;
        Ok(())
    }

    pub fn delete(&self, id: &Pmid) -> Result<ProcessRecord, StoreError> {
        let Some(record) = self.get(id)? else {
            return Err(StoreError::NotFound(id.clone()));
        };
        let path = self.record_path(id);
        fs::remove_file(&path).map_err(io_err(&path))?;
        Ok(record)
    }

    pub fn set_status(&self, id: &Pmid, status: StatusMarker) -> Result<(), StoreError> {
        let Some(mut record) = self.get(id)? else {
            return Err(StoreError::NotFound(id.clone()));
        };
        record.status = status;
        self.put(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DEFAULT_KILL_TIMEOUT_MS, normalize_tags};
    use std::collections::BTreeMap;

    fn record(name: &str, tags: &[&str]) -> ProcessRecord {
        let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        ProcessRecord {
            id: Pmid::generate(),
            name: name.to_string(),
            command: "/bin/true".to_string(),
            args: Vec::new(),
            cwd: PathBuf::from("/"),
            env: BTreeMap::new(),
            tags: normalize_tags(&tags),
            stdout_file: PathBuf::from("/tmp/o"),
            stderr_file: PathBuf::from("/tmp/e"),
            watch: None,
            max_restarts: 0,
            kill_timeout_ms: DEFAULT_KILL_TIMEOUT_MS,
            status: StatusMarker::Created,
        }
    }

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_then_get() {
        let (_dir, store) = store();
        let rec = record("web", &[]);
        store.put(&rec).unwrap();
        assert_eq!(store.get(&rec.id).unwrap(), Some(rec));
    }

    #[test]
    fn test_get_missing_is_none() {
        let (_dir, store) = store();
        assert_eq!(store.get(&Pmid::generate()).unwrap(), None);
    }

    #[test]
    fn test_list_sorted_by_name_and_filtered() {
        let (_dir, store) = store();
        store.put(&record("worker", &["backend"])).unwrap();
        store.put(&record("api", &["backend"])).unwrap();
        store.put(&record("web", &["frontend"])).unwrap();

        let all: Vec<String> = store
            .list(&Filter::default())
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(all, vec!["api", "web", "worker"]);

        let backend: Vec<String> = store
            .list(&Filter::from_selectors(&["backend".into()]))
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(backend, vec!["api", "worker"]);
    }

    #[test]
    fn test_list_skips_corrupt_files() {
        let (_dir, store) = store();
        store.put(&record("web", &[])).unwrap();
        fs::write(store.dir().join("garbage.json"), b"{not json").unwrap();
        fs::write(store.dir().join("notes.txt"), b"ignored").unwrap();
        assert_eq!(store.list(&Filter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_returns_record() {
        let (_dir, store) = store();
        let rec = record("web", &[]);
        store.put(&rec).unwrap();
        let deleted = store.delete(&rec.id).unwrap();
        assert_eq!(deleted.stdout_file, rec.stdout_file);
        assert_eq!(store.get(&rec.id).unwrap(), None);
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let (_dir, store) = store();
        let err = store.delete(&Pmid::generate()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_set_status_updates_marker_only() {
        let (_dir, store) = store();
        let rec = record("web", &[]);
        store.put(&rec).unwrap();
        store
            .set_status(&rec.id, StatusMarker::Stopped { exit_code: 2 })
            .unwrap();
        let got = store.get(&rec.id).unwrap().unwrap();
        assert_eq!(got.status, StatusMarker::Stopped { exit_code: 2 });
        assert_eq!(got.name, rec.name);
    }

    #[test]
    fn test_find_by_name() {
        let (_dir, store) = store();
        let rec = record("web", &[]);
        store.put(&rec).unwrap();
        assert_eq!(store.find_by_name("web").unwrap().map(|r| r.id), Some(rec.id));
        assert!(store.find_by_name("api").unwrap().is_none());
    }
}
