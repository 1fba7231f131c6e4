//! Dual-write coordinator: writes to both SQLite and JSONL with graceful degradation.
//!
//! Architecture: a dedicated logger thread owns the `SqliteLogger` and `JsonlWriter`.
//! The run driver sends `ActivityEvent` via a bounded crossbeam channel. Non-blocking
//! `try_send()` keeps record processing from ever waiting on log I/O.

#![allow(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{AvlError, Result};
use crate::logger::jsonl::{JsonlConfig, JsonlWriter, Severity};
#[cfg(feature = "sqlite")]
use crate::logger::sqlite::{ActivityRow, DaySummaryRow, SqliteLogger};

// ──────────────────── channel capacity ────────────────────

/// Default bounded channel capacity for log events.
const CHANNEL_CAPACITY: usize = 4096;

// ──────────────────── public event type ────────────────────

/// Counters for one processed day.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DayReport {
    pub day: String,
    pub feed: String,
    pub config_hash: String,
    pub files: u64,
    pub records: u64,
    pub observations: u64,
    pub skipped_records: u64,
    pub merge_conflicts: u64,
    pub hash_collisions: u64,
    pub avs_emitted: u64,
    pub slots_emitted: u64,
    pub open_avs: u64,
    pub open_slots: u64,
    pub checkpoint_loaded: bool,
    pub duration_ms: u64,
}

/// Events that can be logged through the dual-write coordinator.
///
/// Serialized with an `event` tag, which is also the activity-table
/// `event_type` (see [`ActivityEvent::kind`]).
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ActivityEvent {
    #[serde(rename = "run_start")]
    RunStarted {
        version: String,
        config_hash: String,
        feed: String,
        first_day: String,
        last_day: String,
    },
    #[serde(rename = "run_finish")]
    RunFinished {
        days: usize,
        ok: bool,
        duration_ms: u64,
    },
    #[serde(rename = "day_complete")]
    DayCompleted(Box<DayReport>),
    #[serde(rename = "checkpoint_save")]
    CheckpointSaved {
        day: String,
        path: String,
        open: u64,
    },
    CheckpointMissing {
        day: String,
        path: String,
    },
    UnknownKey {
        day: String,
        key: String,
    },
    MalformedKey {
        day: String,
        key: String,
        message: String,
    },
    MergeConflict {
        day: String,
        key: String,
        ids: Vec<u64>,
    },
    HashCollision {
        day: String,
        key: String,
        id: u64,
    },
    MalformedRecord {
        day: String,
        path: String,
        message: String,
    },
    MissingInput {
        day: String,
        feed: String,
    },
    /// Written by the logger thread itself when the channel overflowed.
    EventsDropped {
        count: u64,
    },
    Error {
        code: String,
        message: String,
    },
    /// Sentinel to request graceful shutdown of the logger thread.
    #[serde(skip)]
    Shutdown,
}

impl ActivityEvent {
    /// Stable event name used in both backends.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_start",
            Self::RunFinished { .. } => "run_finish",
            Self::DayCompleted(_) => "day_complete",
            Self::CheckpointSaved { .. } => "checkpoint_save",
            Self::CheckpointMissing { .. } => "checkpoint_missing",
            Self::UnknownKey { .. } => "unknown_key",
            Self::MalformedKey { .. } => "malformed_key",
            Self::MergeConflict { .. } => "merge_conflict",
            Self::HashCollision { .. } => "hash_collision",
            Self::MalformedRecord { .. } => "malformed_record",
            Self::MissingInput { .. } => "missing_input",
            Self::EventsDropped { .. } => "events_dropped",
            Self::Error { .. } => "error",
            Self::Shutdown => "shutdown",
        }
    }

    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::RunFinished { ok: false, .. } | Self::MalformedRecord { .. } | Self::Error { .. } => {
                Severity::Critical
            }
            Self::CheckpointMissing { .. }
            | Self::UnknownKey { .. }
            | Self::MalformedKey { .. }
            | Self::MergeConflict { .. }
            | Self::HashCollision { .. }
            | Self::MissingInput { .. }
            | Self::EventsDropped { .. } => Severity::Warning,
            Self::RunStarted { .. }
            | Self::RunFinished { .. }
            | Self::DayCompleted(_)
            | Self::CheckpointSaved { .. }
            | Self::Shutdown => Severity::Info,
        }
    }
}

// ──────────────────── public handle ────────────────────

/// Thread-safe, cheaply-cloneable handle for sending log events.
///
/// Internally wraps a bounded crossbeam `Sender`. The `send()` method uses
/// `try_send()` so callers are never blocked by logging back-pressure.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Send an event to the logger thread. Non-blocking.
    ///
    /// If the channel is full the event is dropped and the dropped-events counter
    /// is incremented.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
        // Disconnected is fine during shutdown.
    }

    /// Number of events dropped due to channel back-pressure.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Request graceful shutdown; join the thread handle to wait for it.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }
}

// ──────────────────── configuration ────────────────────

/// Options for building the dual-write logger.
pub struct DualLoggerConfig {
    /// Path to the SQLite database. `None` disables SQLite.
    pub sqlite_path: Option<PathBuf>,
    /// JSONL writer config (always active).
    pub jsonl_config: JsonlConfig,
    /// Bounded channel capacity.
    pub channel_capacity: usize,
}

impl Default for DualLoggerConfig {
    fn default() -> Self {
        Self {
            sqlite_path: Some(PathBuf::from(default_sqlite_path())),
            jsonl_config: JsonlConfig::default(),
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

fn default_sqlite_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    format!("{home}/.local/share/avl/ledger.sqlite3")
}

// ──────────────────── spawn ────────────────────

/// Spawn the logger thread and return a handle.
///
/// The logger thread runs until `handle.shutdown()` is called or all senders
/// are dropped.
pub fn spawn_logger(
    config: DualLoggerConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(config.channel_capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    let dropped_clone = Arc::clone(&dropped);

    let handle = ActivityLoggerHandle {
        tx,
        dropped_events: dropped,
    };

    let join = thread::Builder::new()
        .name("avl-logger".to_string())
        .spawn(move || {
            logger_thread_main(rx, config.sqlite_path, config.jsonl_config, dropped_clone);
        })
        .map_err(|e| AvlError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

// ──────────────────── logger thread ────────────────────

#[allow(clippy::needless_pass_by_value)]
fn logger_thread_main(
    rx: Receiver<ActivityEvent>,
    sqlite_path: Option<PathBuf>,
    jsonl_config: JsonlConfig,
    dropped: Arc<AtomicU64>,
) {
    #[cfg(feature = "sqlite")]
    let mut sqlite = sqlite_path.and_then(|p| match SqliteLogger::open(&p) {
        Ok(db) => Some(db),
        Err(e) => {
            eprintln!("[AVL-DUAL] failed to open SQLite at {}: {e}", p.display());
            None
        }
    });
    #[cfg(not(feature = "sqlite"))]
    let _ = sqlite_path;

    let mut jsonl = JsonlWriter::open(&jsonl_config);
    #[cfg(feature = "sqlite")]
    let mut sqlite_failures: u32 = 0;

    while let Ok(event) = rx.recv() {
        let d = dropped.swap(0, Ordering::Relaxed);
        if d > 0 {
            jsonl.write(&ActivityEvent::EventsDropped { count: d });
        }

        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }

        jsonl.write(&event);

        #[cfg(feature = "sqlite")]
        {
            if let Some(db) = &sqlite {
                let ok = match &event {
                    ActivityEvent::DayCompleted(report) => db.log_day(&day_row(report)).is_ok(),
                    other => event_to_activity_row(other)
                        .as_ref()
                        .is_none_or(|row| db.log_activity(row).is_ok()),
                };
                if ok {
                    sqlite_failures = 0;
                } else {
                    sqlite_failures += 1;
                    if sqlite_failures >= 3 {
                        eprintln!(
                            "[AVL-DUAL] SQLite write failed {sqlite_failures} times, disabling"
                        );
                        sqlite = None;
                    }
                }
            }
        }
    }

    jsonl.finish();
}

// ──────────────────── event conversion ────────────────────

#[cfg(feature = "sqlite")]
#[allow(clippy::cast_possible_wrap)]
fn day_row(report: &DayReport) -> DaySummaryRow {
    DaySummaryRow {
        run_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        day: report.day.clone(),
        feed: report.feed.clone(),
        config_hash: report.config_hash.clone(),
        files: report.files as i64,
        records: report.records as i64,
        observations: report.observations as i64,
        skipped_records: report.skipped_records as i64,
        merge_conflicts: report.merge_conflicts as i64,
        hash_collisions: report.hash_collisions as i64,
        avs_emitted: report.avs_emitted as i64,
        slots_emitted: report.slots_emitted as i64,
        open_avs: report.open_avs as i64,
        open_slots: report.open_slots as i64,
        checkpoint_loaded: report.checkpoint_loaded,
        duration_ms: report.duration_ms as i64,
    }
}

/// Activity-table view of an event. Day summaries go to their own table.
#[cfg(feature = "sqlite")]
fn event_to_activity_row(event: &ActivityEvent) -> Option<ActivityRow> {
    let mut row = ActivityRow {
        timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        event_type: event.kind().to_string(),
        severity: event.severity().as_str().to_string(),
        day: None,
        feed: None,
        path: None,
        ext_key: None,
        ids: None,
        success: 1,
        error_code: None,
        error_message: None,
        details: None,
    };
    match event {
        ActivityEvent::DayCompleted(_) | ActivityEvent::Shutdown => return None,
        ActivityEvent::RunStarted {
            version,
            config_hash,
            feed,
            first_day,
            last_day,
        } => {
            row.feed = Some(feed.clone());
            row.details = Some(format!(
                "version={version} config_hash={config_hash} days={first_day}..{last_day}"
            ));
        }
        ActivityEvent::RunFinished {
            days,
            ok,
            duration_ms,
        } => {
            row.success = i32::from(*ok);
            row.details = Some(format!("days={days} duration_ms={duration_ms}"));
        }
        ActivityEvent::CheckpointSaved { day, path, open } => {
            row.day = Some(day.clone());
            row.path = Some(path.clone());
            row.details = Some(format!("open={open}"));
        }
        ActivityEvent::CheckpointMissing { day, path } => {
            row.day = Some(day.clone());
            row.path = Some(path.clone());
        }
        ActivityEvent::UnknownKey { day, key } => {
            row.day = Some(day.clone());
            row.ext_key = Some(key.clone());
            row.error_code = Some("AVL-2003".to_string());
        }
        ActivityEvent::MalformedKey { day, key, message } => {
            row.day = Some(day.clone());
            row.ext_key = Some(key.clone());
            row.error_code = Some("AVL-2002".to_string());
            row.error_message = Some(message.clone());
        }
        ActivityEvent::MergeConflict { day, key, ids } => {
            row.day = Some(day.clone());
            row.ext_key = Some(key.clone());
            row.ids = Some(
                ids.iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        ActivityEvent::HashCollision { day, key, id } => {
            row.day = Some(day.clone());
            row.ext_key = Some(key.clone());
            row.ids = Some(id.to_string());
        }
        ActivityEvent::MalformedRecord { day, path, message } => {
            row.day = Some(day.clone());
            row.path = Some(path.clone());
            row.success = 0;
            row.error_code = Some("AVL-2001".to_string());
            row.error_message = Some(message.clone());
        }
        ActivityEvent::MissingInput { day, feed } => {
            row.day = Some(day.clone());
            row.feed = Some(feed.clone());
        }
        ActivityEvent::EventsDropped { count } => {
            row.details = Some(format!("{count} log events dropped due to back-pressure"));
        }
        ActivityEvent::Error { code, message } => {
            row.success = 0;
            row.error_code = Some(code.clone());
            row.error_message = Some(message.clone());
        }
    }
    Some(row)
}

/// Handle whose events land in the returned receiver instead of a logger
/// thread.
#[cfg(test)]
pub(crate) fn capture_handle(capacity: usize) -> (ActivityLoggerHandle, Receiver<ActivityEvent>) {
    let (tx, rx) = bounded(capacity);
    let handle = ActivityLoggerHandle {
        tx,
        dropped_events: Arc::new(AtomicU64::new(0)),
    };
    (handle, rx)
}

// ──────────────────── tests ────────────────────
