#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Structured JSON-lines logging shared by the verification crates.
//!
//! Every record is a single JSON object on its own line. Files are rotated by
//! size: `claims.log` becomes `claims.log.1`, the previous `.1` becomes `.2`,
//! and so on up to the configured number of backups.

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Log severity level, ordered from least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Debug information.
    Debug,
    /// Informational events.
    Info,
    /// Warning indicator.
    Warn,
    /// Error indicator.
    Error,
}

impl LogLevel {
    /// Upper-case label used in serialized records.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" | "WARNING" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            other => anyhow::bail!("unknown log level '{other}'"),
        }
    }
}

/// Structured log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Timestamp in ISO8601.
    pub timestamp: DateTime<Utc>,
    /// Module emitting the log.
    pub module: String,
    /// Severity.
    pub level: LogLevel,
    /// Dotted message identifier or human-readable text.
    pub message: String,
    /// Arbitrary JSON payload for fields.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    /// Creates a record with the provided info.
    #[must_use]
    pub fn new(module: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            module: module.into(),
            level,
            message: message.into(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Attaches metadata when `value` is a JSON object; other values are stored under `value`.
    #[must_use]
    pub fn with_metadata(mut self, value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(map) => self.metadata = map,
            serde_json::Value::Null => {}
            other => {
                self.metadata.insert("value".into(), other);
            }
        }
        self
    }
}

/// Size-based rotation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Rotate once the active file would grow past this many bytes.
    pub max_bytes: u64,
    /// Number of rotated files kept next to the active one.
    pub max_backups: usize,
}

impl RotationPolicy {
    /// Never rotates.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            max_bytes: u64::MAX,
            max_backups: 0,
        }
    }
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            max_backups: 5,
        }
    }
}

struct LogFile {
    file: File,
    written: u64,
}

/// Thread-safe JSON logger with append-only semantics and size rotation.
pub struct JsonLogger {
    path: PathBuf,
    min_level: LogLevel,
    rotation: RotationPolicy,
    writer: Mutex<LogFile>,
}

impl std::fmt::Debug for JsonLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLogger")
            .field("path", &self.path)
            .field("min_level", &self.min_level)
            .field("rotation", &self.rotation)
            .finish_non_exhaustive()
    }
}

impl JsonLogger {
    /// Creates or opens a logger at the desired path with default rotation.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(path, LogLevel::Debug, RotationPolicy::default())
    }

    /// Creates a logger with explicit level filter and rotation policy.
    pub fn with_options(
        path: impl AsRef<Path>,
        min_level: LogLevel,
        rotation: RotationPolicy,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating log directory {}", parent.display()))?;
        }
        let file = open_append(&path)?;
        let written = file.metadata().map(|meta| meta.len()).unwrap_or(0);
        Ok(Self {
            path,
            min_level,
            rotation,
            writer: Mutex::new(LogFile { file, written }),
        })
    }

    /// Returns true if records at `level` pass the filter.
    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    /// Writes a log record as a JSON line, rotating first if needed.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        if !self.enabled(record.level) {
            return Ok(());
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut active = self.writer.lock();
        if active.written > 0 && active.written + line.len() as u64 > self.rotation.max_bytes {
            self.rotate(&mut active)?;
        }
        active.file.write_all(&line)?;
        active.file.flush()?;
        active.written += line.len() as u64;
        Ok(())
    }

    fn rotate(&self, active: &mut LogFile) -> Result<()> {
        if self.rotation.max_backups == 0 {
            active.file = File::create(&self.path)?;
            active.written = 0;
            return Ok(());
        }
        for index in (1..self.rotation.max_backups).rev() {
            let from = backup_path(&self.path, index);
            if from.exists() {
                fs::rename(&from, backup_path(&self.path, index + 1))?;
            }
        }
        fs::rename(&self.path, backup_path(&self.path, 1))
            .with_context(|| format!("rotating {}", self.path.display()))?;
        active.file = open_append(&self.path)?;
        active.written = 0;
        Ok(())
    }

    /// Returns the underlying file path (useful for tests).
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_append(path: &Path) -> Result<File> {
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))
}

/// Path of the `index`-th rotated backup for `path`.
#[must_use]
pub fn backup_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn writes_json_lines() {
        let dir = tempdir().unwrap();
        let logger = JsonLogger::new(dir.path().join("test.log")).unwrap();
        logger
            .log(&LogRecord::new("module", LogLevel::Info, "hello"))
            .unwrap();
        let content = fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("\"message\":\"hello\""));
        assert!(content.contains("\"level\":\"INFO\""));
    }

    #[test]
    fn filters_below_min_level() {
        let dir = tempdir().unwrap();
        let logger = JsonLogger::with_options(
            dir.path().join("filtered.log"),
            LogLevel::Warn,
            RotationPolicy::disabled(),
        )
        .unwrap();
        logger
            .log(&LogRecord::new("m", LogLevel::Info, "quiet"))
            .unwrap();
        logger
            .log(&LogRecord::new("m", LogLevel::Error, "loud"))
            .unwrap();
        let content = fs::read_to_string(logger.path()).unwrap();
        assert!(!content.contains("quiet"));
        assert!(content.contains("loud"));
    }

    #[test]
    fn rotates_when_size_exceeded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rotating.log");
        let logger = JsonLogger::with_options(
            &path,
            LogLevel::Debug,
            RotationPolicy {
                max_bytes: 200,
                max_backups: 2,
            },
        )
        .unwrap();
        for idx in 0..12 {
            let record = LogRecord::new("rotation", LogLevel::Info, format!("entry-{idx}"))
                .with_metadata(json!({ "padding": "x".repeat(40) }));
            logger.log(&record).unwrap();
        }
        assert!(backup_path(&path, 1).exists());
        assert!(backup_path(&path, 2).exists());
        assert!(!backup_path(&path, 3).exists());
        let active = fs::read_to_string(&path).unwrap();
        assert!(active.contains("entry-11"));
    }

    #[test]
    fn parses_level_labels() {
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(" info ".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert!("verbose".parse::<LogLevel>().is_err());
        assert!(LogLevel::Error > LogLevel::Debug);
    }
}
