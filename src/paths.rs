use crate::record::Pmid;
use color_eyre::eyre::bail;
use std::path::{Path, PathBuf};

pub const ENV_HOME: &str = "PM_HOME";

#[derive(Debug, Clone)]
pub struct Paths {
    home: PathBuf,
}

impl Paths {
    pub fn new() -> color_eyre::Result<Self> {
        if let Ok(path) = std::env::var(ENV_HOME)
            && !path.is_empty()
        {
            return Ok(Self {
                home: PathBuf::from(path),
            });
        }
        let Some(base) = dirs::home_dir() else {
            bail!("could not determine home directory");
        };
        Ok(Self {
            home: base.join(".pm"),
        })
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { home: base }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn db_dir(&self) -> PathBuf {
        self.home.join("db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn stdout_log(&self, id: &Pmid) -> PathBuf {
        self.log_dir().join(format!("{id}.stdout"))
    }

    pub fn stderr_log(&self, id: &Pmid) -> PathBuf {
        self.log_dir().join(format!("{id}.stderr"))
    }

    /// Where a supervisor's own diagnostics end up.
    pub fn supervisor_log(&self, id: &Pmid) -> PathBuf {
        self.log_dir().join(format!("{id}.supervisor.log"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> Paths {
        Paths::with_base(PathBuf::from("/tmp/pm-test"))
    }

    #[test]
    fn test_db_dir_under_home() {
        let paths = paths();
        assert!(paths.db_dir().starts_with(paths.home()));
        assert!(paths.db_dir().ends_with("db"));
    }

    #[test]
    fn test_log_files_named_by_pmid() {
        let paths = paths();
        let id = Pmid::generate();
        let out = paths.stdout_log(&id);
        let err = paths.stderr_log(&id);
        assert!(out.starts_with(paths.log_dir()));
        assert_eq!(out.file_name().unwrap(), format!("{id}.stdout").as_str());
        assert_eq!(err.file_name().unwrap(), format!("{id}.stderr").as_str());
    }

    #[test]
    fn test_supervisor_log_is_separate_from_child_logs() {
        let paths = paths();
        let id = Pmid::generate();
        let shim = paths.supervisor_log(&id);
        assert_ne!(shim, paths.stdout_log(&id));
        assert_ne!(shim, paths.stderr_log(&id));
        assert!(shim.to_string_lossy().ends_with(".supervisor.log"));
    }
}
