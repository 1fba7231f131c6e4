//! SQLite run ledger: WAL-mode database for activity events and per-day
//! processing summaries.
//!
//! Uses Write-Ahead Logging so `avl history` can read while a run is writing,
//! and prepared statements for insert throughput.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags, params};

use crate::core::errors::{AvlError, Result};

/// SQLite activity logger and day-summary ledger.
pub struct SqliteLogger {
    conn: Connection,
    path: PathBuf,
}

impl SqliteLogger {
    /// Open (or create) the database at `path`, applying schema and PRAGMAs.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| AvlError::io(parent, source))?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        apply_pragmas(&conn)?;
        apply_schema(&conn)?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ──────────────────── activity_log ────────────────────

    /// Insert a row into `activity_log`.
    pub fn log_activity(&self, row: &ActivityRow) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO activity_log (
                timestamp, event_type, severity, day, feed, path, ext_key,
                ids, success, error_code, error_message, details
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            )?
            .execute(params![
                row.timestamp,
                row.event_type,
                row.severity,
                row.day,
                row.feed,
                row.path,
                row.ext_key,
                row.ids,
                row.success,
                row.error_code,
                row.error_message,
                row.details,
            ])?;
        Ok(())
    }

    /// Query recent activity entries, newest first.
    pub fn recent_activity(&self, limit: u32) -> Result<Vec<ActivityRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT timestamp, event_type, severity, day, feed, path, ext_key,
                    ids, success, error_code, error_message, details
             FROM activity_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(ActivityRow {
                    timestamp: row.get(0)?,
                    event_type: row.get(1)?,
                    severity: row.get(2)?,
                    day: row.get(3)?,
                    feed: row.get(4)?,
                    path: row.get(5)?,
                    ext_key: row.get(6)?,
                    ids: row.get(7)?,
                    success: row.get(8)?,
                    error_code: row.get(9)?,
                    error_message: row.get(10)?,
                    details: row.get(11)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Count activity entries of a given event_type since a timestamp.
    pub fn count_events_since(&self, event_type: &str, since: &str) -> Result<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM activity_log WHERE event_type = ?1 AND timestamp >= ?2",
            params![event_type, since],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ──────────────────── day_summary ────────────────────

    /// Record the outcome of one processed day.
    pub fn log_day(&self, row: &DaySummaryRow) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO day_summary (
                run_at, day, feed, config_hash, files, records, observations,
                skipped_records, merge_conflicts, hash_collisions, avs_emitted,
                slots_emitted, open_avs, open_slots, checkpoint_loaded, duration_ms
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
            )?
            .execute(params![
                row.run_at,
                row.day,
                row.feed,
                row.config_hash,
                row.files,
                row.records,
                row.observations,
                row.skipped_records,
                row.merge_conflicts,
                row.hash_collisions,
                row.avs_emitted,
                row.slots_emitted,
                row.open_avs,
                row.open_slots,
                row.checkpoint_loaded,
                row.duration_ms,
            ])?;
        Ok(())
    }

    /// Most recently recorded days, newest first.
    pub fn recent_days(&self, limit: u32) -> Result<Vec<DaySummaryRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT run_at, day, feed, config_hash, files, records, observations,
                    skipped_records, merge_conflicts, hash_collisions, avs_emitted,
                    slots_emitted, open_avs, open_slots, checkpoint_loaded, duration_ms
             FROM day_summary ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(DaySummaryRow {
                    run_at: row.get(0)?,
                    day: row.get(1)?,
                    feed: row.get(2)?,
                    config_hash: row.get(3)?,
                    files: row.get(4)?,
                    records: row.get(5)?,
                    observations: row.get(6)?,
                    skipped_records: row.get(7)?,
                    merge_conflicts: row.get(8)?,
                    hash_collisions: row.get(9)?,
                    avs_emitted: row.get(10)?,
                    slots_emitted: row.get(11)?,
                    open_avs: row.get(12)?,
                    open_slots: row.get(13)?,
                    checkpoint_loaded: row.get(14)?,
                    duration_ms: row.get(15)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Check that WAL mode is active (for diagnostics).
    pub fn is_wal_mode(&self) -> bool {
        self.conn
            .query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
            .map(|mode| mode.eq_ignore_ascii_case("wal"))
            .unwrap_or(false)
    }
}

// ──────────────────── row types ────────────────────

/// Row for the `activity_log` table.
#[derive(Debug, Clone)]
pub struct ActivityRow {
    pub timestamp: String,
    pub event_type: String,
    pub severity: String,
    pub day: Option<String>,
    pub feed: Option<String>,
    pub path: Option<String>,
    pub ext_key: Option<String>,
    /// Comma-separated internal ids.
    pub ids: Option<String>,
    pub success: i32,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub details: Option<String>,
}

/// Row for the `day_summary` table.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DaySummaryRow {
    pub run_at: String,
    pub day: String,
    pub feed: String,
    pub config_hash: String,
    pub files: i64,
    pub records: i64,
    pub observations: i64,
    pub skipped_records: i64,
    pub merge_conflicts: i64,
    pub hash_collisions: i64,
    pub avs_emitted: i64,
    pub slots_emitted: i64,
    pub open_avs: i64,
    pub open_slots: i64,
    pub checkpoint_loaded: bool,
    pub duration_ms: i64,
}

// ──────────────────── schema & pragmas ────────────────────

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = 5000;",
    )?;
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        eprintln!("[AVL-SQLITE] WARNING: requested WAL mode but got '{mode}'");
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS activity_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            day TEXT,
            feed TEXT,
            path TEXT,
            ext_key TEXT,
            ids TEXT,
            success INTEGER NOT NULL DEFAULT 1,
            error_code TEXT,
            error_message TEXT,
            details TEXT
        );

        CREATE TABLE IF NOT EXISTS day_summary (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_at TEXT NOT NULL,
            day TEXT NOT NULL,
            feed TEXT NOT NULL,
            config_hash TEXT NOT NULL,
            files INTEGER NOT NULL,
            records INTEGER NOT NULL,
            observations INTEGER NOT NULL,
            skipped_records INTEGER NOT NULL,
            merge_conflicts INTEGER NOT NULL,
            hash_collisions INTEGER NOT NULL,
            avs_emitted INTEGER NOT NULL,
            slots_emitted INTEGER NOT NULL,
            open_avs INTEGER NOT NULL,
            open_slots INTEGER NOT NULL,
            checkpoint_loaded INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_activity_timestamp ON activity_log(timestamp);
        CREATE INDEX IF NOT EXISTS idx_activity_type_time ON activity_log(event_type, timestamp);
        CREATE INDEX IF NOT EXISTS idx_day_summary_day ON day_summary(day, feed);",
    )?;
    Ok(())
}

// ──────────────────── tests ────────────────────
