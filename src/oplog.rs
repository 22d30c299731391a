//! Human-readable operations log.
//!
//! Pipeline stages and memory checkpoints are recorded as lines of the form
//! `[YYYY-MM-DD HH:MM:SS] message`, timestamped in UTC. The log is shown on the memory page and
//! may be cleared over the API.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use time::macros::format_description;
use time::OffsetDateTime;

/// Sink for operations log lines.
pub trait OperationLog: Send + Sync {
    /// Append a timestamped message.
    fn record(&self, message: &str);
}

/// Format a log line for `message` at `at`.
pub fn format_line(at: OffsetDateTime, message: &str) -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    // The format only uses components present in every OffsetDateTime.
    let stamp = at.format(format).unwrap_or_default();
    format!("[{}] {}", stamp, message)
}

/// Operations log appended to a local file.
///
/// Write failures are reported through `tracing` and otherwise ignored; the operations log must
/// never fail a pipeline run.
pub struct FileOperationLog {
    path: PathBuf,
}

impl FileOperationLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current contents of the log. A missing log is empty.
    pub async fn contents(&self) -> std::io::Result<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            result => result,
        }
    }

    /// Delete the log. Returns whether a log existed.
    pub async fn clear(&self) -> std::io::Result<bool> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)
    }
}

impl OperationLog for FileOperationLog {
    fn record(&self, message: &str) {
        tracing::info!("{}", message);
        let line = format_line(OffsetDateTime::now_utc(), message);
        if let Err(err) = self.append(&line) {
            tracing::warn!("Failed to write to {}: {}", self.path.display(), err);
        }
    }
}

/// Operations log held in memory.
#[derive(Default)]
pub struct MemoryOperationLog {
    lines: Mutex<Vec<String>>,
}

impl MemoryOperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages recorded so far, without timestamps.
    pub fn messages(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }
}

impl OperationLog for MemoryOperationLog {
    fn record(&self, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(message.to_string());
        }
    }
}
