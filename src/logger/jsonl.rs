//! JSONL activity log: one self-contained JSON object per [`ActivityEvent`].
//!
//! A run opens the file once, appends while days are processed and syncs it
//! when the logger thread stops. Rotation happens at open time, so the lines
//! of one run never straddle two files. If the file cannot be opened or
//! written, lines go to stderr with an `[AVL-JSONL]` prefix; a run never
//! fails because its log could not be written.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::errors::{AvlError, Result};
use crate::logger::dual::ActivityEvent;

/// Severity level for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// One log line: the event's own fields plus a timestamp and severity.
#[derive(Debug, Serialize)]
pub struct LogEntry<'a> {
    /// RFC 3339 UTC timestamp, millisecond precision.
    pub ts: String,
    pub severity: Severity,
    #[serde(flatten)]
    pub event: &'a ActivityEvent,
}

impl<'a> LogEntry<'a> {
    #[must_use]
    pub fn new(event: &'a ActivityEvent) -> Self {
        Self {
            ts: utc_now(),
            severity: event.severity(),
            event,
        }
    }
}

/// Where the activity log goes and how many old runs to keep.
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    /// Size at which the file is rotated before a run appends to it.
    pub max_size_bytes: u64,
    /// Rotated files kept as `<path>.1` (newest) to `<path>.N`.
    pub max_rotated_files: u32,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            path: default_jsonl_path(),
            max_size_bytes: 50 * 1024 * 1024,
            max_rotated_files: 5,
        }
    }
}

fn default_jsonl_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(format!("{home}/.local/share/avl/activity.jsonl"))
}

enum Sink {
    File(BufWriter<File>),
    Stderr,
}

/// Append-only writer for one run's activity.
pub struct JsonlWriter {
    path: PathBuf,
    sink: Sink,
    lines: u64,
}

impl JsonlWriter {
    /// Rotate the log if it has grown past its limit, then open it for
    /// appending. Falls back to stderr when that fails.
    pub fn open(config: &JsonlConfig) -> Self {
        let sink = match open_for_run(config) {
            Ok(file) => Sink::File(BufWriter::new(file)),
            Err(e) => {
                eprintln!("[AVL-JSONL] {e}; writing activity to stderr");
                Sink::Stderr
            }
        };
        Self {
            path: config.path.clone(),
            sink,
            lines: 0,
        }
    }

    pub fn write(&mut self, event: &ActivityEvent) {
        let line = match serde_json::to_string(&LogEntry::new(event)) {
            Ok(line) => line,
            Err(e) => {
                eprintln!("[AVL-JSONL] cannot encode {} event: {e}", event.kind());
                return;
            }
        };

        let failed = match &mut self.sink {
            Sink::File(w) => writeln!(w, "{line}").err(),
            Sink::Stderr => None,
        };
        if let Some(e) = failed {
            eprintln!(
                "[AVL-JSONL] write to {} failed: {e}; writing activity to stderr",
                self.path.display()
            );
            self.sink = Sink::Stderr;
        }
        if matches!(self.sink, Sink::Stderr) {
            eprintln!("[AVL-JSONL] {line}");
        }
        self.lines += 1;
    }

    /// Flush and sync the file. Called once when the logger thread stops.
    pub fn finish(&mut self) {
        if let Sink::File(w) = &mut self.sink {
            let _ = w.flush();
            let _ = w.get_ref().sync_data();
        }
    }

    #[must_use]
    pub fn lines_written(&self) -> u64 {
        self.lines
    }

    /// Whether lines are going to stderr instead of the file.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        matches!(self.sink, Sink::Stderr)
    }
}

fn open_for_run(config: &JsonlConfig) -> Result<File> {
    let path = &config.path;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| AvlError::io(parent, source))?;
    }
    if fs::metadata(path).is_ok_and(|meta| meta.len() >= config.max_size_bytes) {
        rotate(path, config.max_rotated_files);
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| AvlError::io(path, source))
}

/// `<path>` becomes `<path>.1`, `.1` becomes `.2`, and `.keep` is dropped.
fn rotate(base: &Path, keep: u32) {
    if keep == 0 {
        let _ = fs::remove_file(base);
        return;
    }
    let _ = fs::remove_file(rotated_name(base, keep));
    for i in (1..keep).rev() {
        let _ = fs::rename(rotated_name(base, i), rotated_name(base, i + 1));
    }
    let _ = fs::rename(base, rotated_name(base, 1));
}

fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn utc_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
