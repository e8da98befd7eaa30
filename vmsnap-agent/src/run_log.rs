//! Per-attempt run log
//!
//! Every message is emitted through `log` and buffered as a JSON line so the
//! whole attempt can be shipped to the host's logs blob, or appended to a
//! local file when no blob was given. Commits are best effort.

use anyhow::{Context, Result};
use chrono::Utc;
use std::io::Write;
use std::path::PathBuf;

use crate::blob::BlobWriter;

/// One buffered log line
#[derive(Debug, Clone, serde::Serialize)]
struct RunLogEntry {
    timestamp: String,
    level: &'static str,
    message: String,
}

/// Destination for committed run logs
pub trait LogSink {
    /// `full` is every line so far; `new` only the lines since the last commit
    fn commit(&self, full: &str, new: &str) -> Result<()>;
}

/// Replaces the logs blob with the full log on every commit
pub struct BlobLogSink {
    writer: BlobWriter,
    uri: String,
}

impl BlobLogSink {
    pub fn new(writer: BlobWriter, uri: String) -> Self {
        Self { writer, uri }
    }
}

impl LogSink for BlobLogSink {
    fn commit(&self, full: &str, _new: &str) -> Result<()> {
        self.writer
            .put_block_blob(&self.uri, full.as_bytes(), "text/plain; charset=utf-8")
    }
}

/// Appends new lines to a local file
pub struct LocalLogSink {
    path: PathBuf,
}

impl LocalLogSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl LogSink for LocalLogSink {
    fn commit(&self, _full: &str, new: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(new.as_bytes())
            .with_context(|| format!("Failed to append to {}", self.path.display()))
    }
}

/// Buffered log of one backup attempt
#[derive(Default)]
pub struct RunLog {
    entries: Vec<String>,
    committed: usize,
    sink: Option<Box<dyn LogSink>>,
}

impl RunLog {
    pub fn new(sink: Option<Box<dyn LogSink>>) -> Self {
        Self {
            entries: Vec::new(),
            committed: 0,
            sink,
        }
    }

    pub fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::info!(target: "vmsnap::run", "{message}");
        self.push("Info", message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!(target: "vmsnap::run", "{message}");
        self.push("Warning", message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::error!(target: "vmsnap::run", "{message}");
        self.push("Error", message);
    }

    fn push(&mut self, level: &'static str, message: String) {
        let entry = RunLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level,
            message,
        };
        // Fallback to unstructured if serialization fails
        let line = serde_json::to_string(&entry)
            .unwrap_or_else(|_| format!("{} {} {}", entry.timestamp, entry.level, entry.message));
        self.entries.push(line);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ship buffered lines to the sink. Failures are logged and swallowed.
    /// Returns whether anything was committed.
    pub fn commit(&mut self) -> bool {
        let Some(sink) = self.sink.as_ref() else {
            return false;
        };
        if self.is_empty() || self.committed == self.entries.len() {
            return false;
        }

        let full = join_lines(&self.entries);
        let new = join_lines(&self.entries[self.committed..]);
        match sink.commit(&full, &new) {
            Ok(()) => {
                self.committed = self.entries.len();
                true
            }
            Err(e) => {
                log::warn!("Failed to commit run log: {e:#}");
                false
            }
        }
    }
}

fn join_lines(lines: &[String]) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}
