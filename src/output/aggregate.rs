//! Multi-day slot aggregation.
//!
//! The same slot shows up in many daily `slots_<day>.csv` files (it is
//! checked for days before it happens). This folds them into one row per
//! `(id, slot_time, offset)`.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{Datelike, Duration, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::core::dates::{TIMESTAMP_FORMAT, parse_timestamp};
use crate::core::errors::{AvlError, Result};
use crate::identity::resolver::InternalId;

/// Default output file name inside the output directory.
pub const AGGREGATE_FILE: &str = "slots_grouped_all.csv";

const SLOT_FORMAT: &str = "%Y-%m-%d %H:%M";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AggregateSummary {
    pub files: usize,
    pub rows_in: u64,
    pub rows_out: u64,
}

#[derive(Debug, Deserialize)]
struct SlotRow {
    id: InternalId,
    slot_time: String,
    first_seen: String,
    last_seen: String,
    offset: i32,
    available: u8,
}

#[derive(Debug, Clone, Copy)]
struct Folded {
    first_seen: NaiveDateTime,
    last_seen: NaiveDateTime,
    available: u8,
}

/// Daily slot tables in `dir`, sorted by name.
pub fn slot_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(AvlError::io(dir, e)),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| AvlError::io(dir, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let is_daily = name
            .strip_prefix("slots_")
            .and_then(|rest| rest.strip_suffix(".csv"))
            .is_some_and(|day| chrono::NaiveDate::parse_from_str(day, "%Y-%m-%d").is_ok());
        if is_daily {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn bad_row(path: &Path, line: u64, details: &str) -> AvlError {
    AvlError::Csv {
        context: "slot aggregation",
        details: format!("{}:{line}: {details}", path.display()),
    }
}

/// Aggregate every daily slot table in `in_dir` into `out`.
///
/// Output columns: `id, slot_time, hod, dow, first_seen, last_seen,
/// available`, all times local (UTC plus the slot's offset), `dow` counted
/// from Monday = 0.
pub fn aggregate_slots(in_dir: &Path, out: &Path) -> Result<AggregateSummary> {
    let files = slot_files(in_dir)?;
    let mut groups: BTreeMap<(InternalId, NaiveDateTime, i32), Folded> = BTreeMap::new();
    let mut rows_in = 0_u64;

    for path in &files {
        let file = File::open(path).map_err(|e| AvlError::io(path, e))?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(file);
        for (index, row) in reader.deserialize::<SlotRow>().enumerate() {
            let line = index as u64 + 1;
            let row = row.map_err(|e| bad_row(path, line, &e.to_string()))?;
            let slot_time = NaiveDateTime::parse_from_str(&row.slot_time, SLOT_FORMAT)
                .map_err(|e| bad_row(path, line, &format!("slot_time: {e}")))?;
            let first_seen = parse_timestamp(&row.first_seen)
                .ok_or_else(|| bad_row(path, line, "unparseable first_seen"))?;
            let last_seen = parse_timestamp(&row.last_seen)
                .ok_or_else(|| bad_row(path, line, "unparseable last_seen"))?;
            rows_in += 1;

            groups
                .entry((row.id, slot_time, row.offset))
                .and_modify(|folded| {
                    folded.first_seen = folded.first_seen.min(first_seen);
                    folded.last_seen = folded.last_seen.max(last_seen);
                    folded.available = folded.available.max(row.available);
                })
                .or_insert(Folded {
                    first_seen,
                    last_seen,
                    available: row.available,
                });
        }
    }

    if let Some(parent) = out.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| AvlError::io(parent, e))?;
    }
    let tmp = out.with_extension("csv.tmp");
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(&tmp)?;
    for ((id, slot_time, offset), folded) in &groups {
        let shift = Duration::hours(i64::from(*offset));
        let local_slot = *slot_time + shift;
        writer.serialize((
            id,
            local_slot.format(SLOT_FORMAT).to_string(),
            local_slot.hour(),
            local_slot.weekday().num_days_from_monday(),
            (folded.first_seen + shift).format(TIMESTAMP_FORMAT).to_string(),
            (folded.last_seen + shift).format(TIMESTAMP_FORMAT).to_string(),
            folded.available,
        ))?;
    }
    writer.flush().map_err(|e| AvlError::io(&tmp, e))?;
    drop(writer);
    fs::rename(&tmp, out).map_err(|e| AvlError::io(out, e))?;

    Ok(AggregateSummary {
        files: files.len(),
        rows_in,
        rows_out: groups.len() as u64,
    })
}
