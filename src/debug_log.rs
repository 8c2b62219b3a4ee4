//! File-backed debug log.
//!
//! Every diagnostic the service bridge emits is appended to a plain text file
//! as `<timestamp>> <message>`, which is often the only place to look when a
//! service fails before any console is attached.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Default log file name, created in the system temp directory.
pub const DEFAULT_LOG_NAME: &str = "service.log";

/// Appends timestamped lines to a log file.
pub struct DebugLog {
    path: PathBuf,
    // Serializes writers so lines from concurrent callbacks do not interleave
    lock: Mutex<()>,
}

impl DebugLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Format one log line.
    pub fn format_line(timestamp: DateTime<Utc>, message: &str) -> String {
        format!(
            "{}> {}",
            timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            message
        )
    }

    /// Append `message`, creating the file and its directory if needed.
    pub fn write(&self, message: &str) -> std::io::Result<()> {
        let _guard = self
            .lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", Self::format_line(Utc::now(), message))?;
        Ok(())
    }

    /// Append `message`, logging instead of failing.
    pub fn record(&self, message: &str) {
        if let Err(e) = self.write(message) {
            tracing::warn!(error = %e, path = %self.path.display(), "Failed to write debug log");
        }
    }
}

impl Default for DebugLog {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join(DEFAULT_LOG_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_format_line() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(
            DebugLog::format_line(ts, "ServiceMain()"),
            "2024-03-01T12:30:05.000Z> ServiceMain()"
        );
    }

    #[test]
    fn test_write_appends_lines() {
        let dir = TempDir::new().unwrap();
        let log = DebugLog::new(dir.path().join("service.log"));

        log.write("first").unwrap();
        log.record("second");

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("> first"));
        assert!(lines[1].ends_with("> second"));
    }

    #[test]
    fn test_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let log = DebugLog::new(dir.path().join("nested").join("logs").join("service.log"));

        log.write("hello").unwrap();
        assert!(log.path().exists());
    }

    #[test]
    fn test_default_path_is_in_temp_dir() {
        let log = DebugLog::default();
        assert_eq!(log.path(), std::env::temp_dir().join("service.log"));
    }
}
