use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// 10 MB rotation threshold
pub const LOG_ROTATION_SIZE: u64 = 10 * 1024 * 1024;

/// Keep up to 3 rotated files (.1, .2, .3)
pub const LOG_ROTATION_KEEP: u32 = 3;

// ---------------------------------------------------------------------------
// LogWriter: append-only file with size-based rotation
// ---------------------------------------------------------------------------

pub struct LogWriter {
    path: PathBuf,
    file: tokio::fs::File,
    size: u64,
    max_size: u64,
    keep: u32,
}

/// Shared between the copier tasks of successive launches.
pub type SharedLogWriter = Arc<Mutex<LogWriter>>;

async fn open_append(path: &Path) -> io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

impl LogWriter {
    pub async fn open(path: &Path) -> io::Result<Self> {
        Self::with_limits(path, LOG_ROTATION_SIZE, LOG_ROTATION_KEEP).await
    }

    pub async fn with_limits(path: &Path, max_size: u64, keep: u32) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = open_append(path).await?;
        let size = file.metadata().await?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
            max_size,
            keep,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shared(self) -> SharedLogWriter {
        Arc::new(Mutex::new(self))
    }

    /// Appends `bytes`, rotating first if they would push the file past the
    /// threshold. A non-empty file is never left empty by rotation alone.
    pub async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.size > 0 && self.size + bytes.len() as u64 > self.max_size {
            self.file.flush().await?;
            rotate_log(&self.path, self.keep).await?;
            self.file = open_append(&self.path).await?;
            self.size = 0;
        }
        self.file.write_all(bytes).await?;
        self.size += bytes.len() as u64;
        Ok(())
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.file.flush().await
    }
}

// ---------------------------------------------------------------------------
// rotate_log: shift rotated files and rename current to .1
// ---------------------------------------------------------------------------

pub async fn rotate_log(path: &Path, keep: u32) -> io::Result<()> {
    if keep == 0 {
        return match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        };
    }

    let oldest = rotated_path(path, keep);
    if tokio::fs::try_exists(&oldest).await.unwrap_or(false) {
        tokio::fs::remove_file(&oldest).await?;
    }

    for i in (1..keep).rev() {
        let from = rotated_path(path, i);
        if tokio::fs::try_exists(&from).await.unwrap_or(false) {
            tokio::fs::rename(&from, rotated_path(path, i + 1)).await?;
        }
    }

    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        tokio::fs::rename(path, rotated_path(path, 1)).await?;
    }
    Ok(())
}

pub fn rotated_path(path: &Path, n: u32) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(format!(".{n}"));
    p.into()
}

/// The live file plus every rotated sibling that may exist.
pub fn all_log_files(path: &Path) -> Vec<PathBuf> {
    std::iter::once(path.to_path_buf())
        .chain((1..=LOG_ROTATION_KEEP).map(|n| rotated_path(path, n)))
        .collect()
}

// ---------------------------------------------------------------------------
// Copier: drains a child pipe into a writer, line by line
// ---------------------------------------------------------------------------

pub fn spawn_log_copier<R>(reader: R, writer: SharedLogWriter) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = run_log_copier(reader, &writer).await {
            let path = writer.lock().await.path().display().to_string();
            warn!(path = %path, error = %e, "log copier stopped");
        }
    })
}

pub async fn run_log_copier<R>(reader: R, writer: &SharedLogWriter) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        // Raw bytes: children are free to print non-UTF-8.
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        writer.lock().await.write(&line).await?;
    }
    writer.lock().await.flush().await
}

// ---------------------------------------------------------------------------
// tail_file: read last N lines from a file
// ---------------------------------------------------------------------------

pub fn tail_file(path: &Path, n: usize) -> io::Result<Vec<String>> {
    use std::io::{Read, Seek, SeekFrom};

    if n == 0 {
        return Ok(Vec::new());
    }

    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    // Scan backwards chunk by chunk until n+1 newlines have been seen; the
    // last line's own terminator does not count as a boundary.
    const CHUNK: u64 = 8192;
    let len = file.metadata()?.len();
    let mut pos = len;
    let mut newlines = 0;
    let mut start = 0;

    'scan: while pos > 0 {
        let from = pos.saturating_sub(CHUNK);
        let mut buf = vec![0u8; (pos - from) as usize];
        file.seek(SeekFrom::Start(from))?;
        file.read_exact(&mut buf)?;

        for (i, _) in buf.iter().enumerate().rev().filter(|(_, b)| **b == b'\n') {
            newlines += 1;
            if newlines > n {
                start = from + i as u64 + 1;
                break 'scan;
            }
        }
        pos = from;
    }

    file.seek(SeekFrom::Start(start))?;
    let mut tail = Vec::new();
    file.read_to_end(&mut tail)?;

    let mut lines: Vec<String> = String::from_utf8_lossy(&tail)
        .lines()
        .map(String::from)
        .collect();
    if lines.len() > n {
        lines.drain(..lines.len() - n);
    }
    Ok(lines)
}

// ---------------------------------------------------------------------------
// LogFollower: poll a file for appended bytes
// ---------------------------------------------------------------------------

/// Remembers how far into a file we have read. A file that shrinks (it was
/// rotated or truncated) is read again from the start.
pub struct LogFollower {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
}

impl LogFollower {
    /// Starts at the current end of the file.
    pub fn from_end(path: &Path) -> Self {
        let offset = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        Self {
            path: path.to_path_buf(),
            offset,
            partial: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Complete lines appended since the last call.
    pub fn poll_lines(&mut self) -> io::Result<Vec<String>> {
        use std::io::{Read, Seek, SeekFrom};

        let mut file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let len = file.metadata()?.len();
        if len < self.offset {
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        self.offset += buf.len() as u64;
        self.partial.extend_from_slice(&buf);

        let Some(last_nl) = self.partial.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };
        let rest = self.partial.split_off(last_nl + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        Ok(String::from_utf8_lossy(&complete)
            .lines()
            .map(String::from)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
