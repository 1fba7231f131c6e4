//! Day-addressed checkpoint of open intervals.
//!
//! Location state file (`state_<day>_avs.json`):
//!
//! ```text
//! {"17": ["2021-05-01 23:40:02", "2021-05-01 23:55:10", -4, 12]}
//! ```
//!
//! Slot state file (`state_<day>_slots.json`), keyed by local slot start:
//!
//! ```text
//! {"17": {"2021-05-02T09:30:00-04:00": ["2021-05-01 23:40:02", "2021-05-01 23:55:10", 1]}}
//! ```

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde_json::{Map, Value, json};

use crate::coalesce::interval::{LocationKey, OpenInterval, SlotKey, SlotTime};
use crate::coalesce::value::{Availability, SlotAvailability};
use crate::core::dates::{DAY_FORMAT, days_before, format_timestamp, parse_timestamp};
use crate::core::errors::{AvlError, Result};

/// Open location intervals, as carried between days.
pub type LocationState = BTreeMap<LocationKey, OpenInterval<Availability>>;

/// Open slot intervals, as carried between days.
pub type SlotState = BTreeMap<SlotKey, OpenInterval<SlotAvailability>>;

/// Persistence for open-interval state, addressed by the day that resumes it.
///
/// `load_*` returns `Ok(None)` when no checkpoint exists for `day`.
pub trait StateStore {
    fn load_avs(&self, day: NaiveDate) -> Result<Option<LocationState>>;

    /// Slots starting more than `retention_days` before `day` are dropped.
    fn load_slots(&self, day: NaiveDate, retention_days: u64) -> Result<Option<SlotState>>;

    fn save_avs(&self, day: NaiveDate, state: &LocationState) -> Result<()>;

    fn save_slots(&self, day: NaiveDate, state: &SlotState) -> Result<()>;
}

/// JSON checkpoints in one directory, replaced atomically via rename.
#[derive(Debug, Clone)]
pub struct FsStateStore {
    dir: PathBuf,
}

impl FsStateStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn avs_path(&self, day: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("state_{}_avs.json", day.format(DAY_FORMAT)))
    }

    #[must_use]
    pub fn slots_path(&self, day: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("state_{}_slots.json", day.format(DAY_FORMAT)))
    }

    fn read_json(path: &Path) -> Result<Option<Value>> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(AvlError::io(path, error)),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|error| corrupt(path, format!("invalid JSON: {error}")))
    }

    fn write_json(path: &Path, value: &Value) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| AvlError::io(parent, error))?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let data = serde_json::to_vec(value)?;
        fs::write(&tmp_path, data).map_err(|error| AvlError::io(&tmp_path, error))?;
        fs::rename(&tmp_path, path).map_err(|error| AvlError::io(path, error))?;
        Ok(())
    }
}

impl StateStore for FsStateStore {
    fn load_avs(&self, day: NaiveDate) -> Result<Option<LocationState>> {
        let path = self.avs_path(day);
        let Some(doc) = Self::read_json(&path)? else {
            return Ok(None);
        };
        decode_avs(&path, &doc).map(Some)
    }

    fn load_slots(&self, day: NaiveDate, retention_days: u64) -> Result<Option<SlotState>> {
        let path = self.slots_path(day);
        let Some(doc) = Self::read_json(&path)? else {
            return Ok(None);
        };
        let cutoff = days_before(day, retention_days);
        decode_slots(&path, &doc, cutoff).map(Some)
    }

    fn save_avs(&self, day: NaiveDate, state: &LocationState) -> Result<()> {
        Self::write_json(&self.avs_path(day), &encode_avs(state))
    }

    fn save_slots(&self, day: NaiveDate, state: &SlotState) -> Result<()> {
        Self::write_json(&self.slots_path(day), &encode_slots(state))
    }
}

// ──────────────────── encoding ────────────────────

fn encode_avs(state: &LocationState) -> Value {
    let mut doc = Map::new();
    for (id, open) in state {
        doc.insert(
            id.to_string(),
            json!([
                format_timestamp(open.first_seen),
                format_timestamp(open.last_seen),
                open.utc_offset,
                open.value,
            ]),
        );
    }
    Value::Object(doc)
}

fn encode_slots(state: &SlotState) -> Value {
    let mut doc = Map::new();
    for ((id, slot), open) in state {
        let entry = doc
            .entry(id.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(slots) = entry {
            slots.insert(
                slot.to_string(),
                json!([
                    format_timestamp(open.first_seen),
                    format_timestamp(open.last_seen),
                    open.value,
                ]),
            );
        }
    }
    Value::Object(doc)
}

// ──────────────────── decoding ────────────────────

fn corrupt(path: &Path, details: impl Into<String>) -> AvlError {
    AvlError::CorruptCheckpoint {
        path: path.to_path_buf(),
        details: details.into(),
    }
}

fn top_level<'a>(path: &Path, doc: &'a Value) -> Result<&'a Map<String, Value>> {
    doc.as_object()
        .ok_or_else(|| corrupt(path, "top level is not an object"))
}

fn parse_id(path: &Path, raw: &str) -> Result<LocationKey> {
    match raw.parse::<LocationKey>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(corrupt(path, format!("key {raw:?} is not a positive id"))),
    }
}

fn parse_seen(path: &Path, context: &str, value: Option<&Value>) -> Result<chrono::NaiveDateTime> {
    value
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .ok_or_else(|| corrupt(path, format!("{context}: bad timestamp {value:?}")))
}

fn decode_avs(path: &Path, doc: &Value) -> Result<LocationState> {
    let mut state = LocationState::new();
    for (raw_id, entry) in top_level(path, doc)? {
        let id = parse_id(path, raw_id)?;
        let fields = entry
            .as_array()
            .filter(|fields| fields.len() == 4)
            .ok_or_else(|| corrupt(path, format!("id {id}: expected 4 fields")))?;
        let utc_offset = fields[2]
            .as_i64()
            .and_then(|offset| i32::try_from(offset).ok())
            .ok_or_else(|| corrupt(path, format!("id {id}: bad utc offset")))?;
        let value: Availability = serde_json::from_value(fields[3].clone())
            .map_err(|error| corrupt(path, format!("id {id}: {error}")))?;
        state.insert(
            id,
            OpenInterval {
                first_seen: parse_seen(path, raw_id, fields.first())?,
                last_seen: parse_seen(path, raw_id, fields.get(1))?,
                utc_offset,
                value,
            },
        );
    }
    Ok(state)
}

fn decode_slots(path: &Path, doc: &Value, cutoff: NaiveDate) -> Result<SlotState> {
    let mut state = SlotState::new();
    for (raw_id, slots) in top_level(path, doc)? {
        let id = parse_id(path, raw_id)?;
        let slots = slots
            .as_object()
            .ok_or_else(|| corrupt(path, format!("id {id}: slots are not an object")))?;
        for (raw_slot, entry) in slots {
            let slot = SlotTime::parse(raw_slot)
                .ok_or_else(|| corrupt(path, format!("id {id}: bad slot time {raw_slot:?}")))?;
            if slot.local().date_naive() < cutoff {
                continue;
            }
            // Older checkpoints carried a fourth, since-dropped field.
            let fields = entry
                .as_array()
                .filter(|fields| fields.len() >= 3)
                .ok_or_else(|| corrupt(path, format!("id {id} slot {raw_slot}: expected 3 fields")))?;
            let value: SlotAvailability = serde_json::from_value(fields[2].clone())
                .map_err(|error| corrupt(path, format!("id {id} slot {raw_slot}: {error}")))?;
            state.insert(
                (id, slot),
                OpenInterval {
                    first_seen: parse_seen(path, raw_slot, fields.first())?,
                    last_seen: parse_seen(path, raw_slot, fields.get(1))?,
                    utc_offset: slot.offset_hours(),
                    value,
                },
            );
        }
    }
    Ok(state)
}
