//! Feed kinds and per-feed interpretation of one raw record.

#![allow(missing_docs)]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::coalesce::interval::SlotTime;
use crate::coalesce::value::SlotAvailability;
use crate::core::errors::{AvlError, Result};
use crate::identity::keys::ExternalKey;

use super::location::LocationRecord;
use super::normalize::{
    CheckTime, RawObservation, external_keys, parse_checked_time, touches_appointments,
    univaf_availability, univaf_slots, vaccinespotter_block,
};

/// Scheme used for vaccinespotter location ids.
pub const VACCINESPOTTER_SCHEME: &str = "vaccinespotter";

/// One of the supported provider feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[cfg_attr(feature = "cli", value(rename_all = "snake_case"))]
pub enum Feed {
    /// Periodic JSON-array dumps of the univaf locations API.
    #[default]
    UnivafSnapshot,
    /// univaf availability change log (ndjson), ids seeded from side files.
    UnivafLog,
    /// Gzipped vaccinespotter database change log.
    Vaccinespotter,
}

impl Feed {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnivafSnapshot => "univaf_snapshot",
            Self::UnivafLog => "univaf_log",
            Self::Vaccinespotter => "vaccinespotter",
        }
    }

    /// Whether unseen keys get a new internal id. The log feed only looks
    /// keys up; its ids come from the seeding files.
    #[must_use]
    pub const fn mints_ids(self) -> bool {
        !matches!(self, Self::UnivafLog)
    }

    #[must_use]
    pub const fn has_slots(self) -> bool {
        !matches!(self, Self::Vaccinespotter)
    }

    /// Interpret one raw record.
    pub fn interpret(self, record: &Value, source_name: &str, with_slots: bool) -> Result<Interpretation> {
        let Some(row) = record.as_object() else {
            return Err(AvlError::malformed(source_name, "record is not an object", record));
        };
        match self {
            Self::UnivafSnapshot => univaf_snapshot(row, source_name, record, with_slots),
            Self::UnivafLog => univaf_log(row, source_name, record, with_slots),
            Self::Vaccinespotter => vaccinespotter(row, source_name, record),
        }
    }
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A slot-level observation before id resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSlot {
    pub checked: CheckTime,
    pub slot: SlotTime,
    pub value: SlotAvailability,
}

/// Everything one raw record says, keyed by external ids.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedRecord {
    pub primary: ExternalKey,
    pub externals: Vec<ExternalKey>,
    pub location: Option<LocationRecord>,
    pub observations: Vec<RawObservation>,
    pub slots: Vec<RawSlot>,
}

/// Why a record was passed over without touching any state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Pagination marker row of the snapshot API.
    Pagination,
    /// Log row without an availability value.
    NoAvailability,
    /// Change-log action other than INSERT/UPDATE/DELETE.
    UnknownAction(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Interpretation {
    Record(Box<FeedRecord>),
    Skip(SkipReason),
}

fn scalar_id(row: &Map<String, Value>, field: &str, source_name: &str, record: &Value) -> Result<String> {
    match row.get(field) {
        Some(Value::String(id)) if !id.trim().is_empty() => Ok(id.clone()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        _ => Err(AvlError::malformed(
            source_name,
            format!("missing location id field `{field}`"),
            record,
        )),
    }
}

fn checked_time(block: &Map<String, Value>, source_name: &str, record: &Value) -> Result<CheckTime> {
    let raw = block
        .get("valid_at")
        .and_then(Value::as_str)
        .ok_or_else(|| AvlError::malformed(source_name, "missing valid_at", record))?;
    parse_checked_time(raw).ok_or_else(|| {
        AvlError::malformed(source_name, format!("unparseable valid_at {raw:?}"), record)
    })
}

fn slots_of(
    block: &Map<String, Value>,
    checked: CheckTime,
    source_name: &str,
    record: &Value,
) -> Result<Vec<RawSlot>> {
    Ok(univaf_slots(block, source_name, record)?
        .into_iter()
        .map(|(slot, value)| RawSlot {
            checked,
            slot,
            value,
        })
        .collect())
}

fn univaf_snapshot(
    row: &Map<String, Value>,
    source_name: &str,
    record: &Value,
    with_slots: bool,
) -> Result<Interpretation> {
    if row.contains_key("__next__") {
        return Ok(Interpretation::Skip(SkipReason::Pagination));
    }
    let id = scalar_id(row, "id", source_name, record)?;
    let primary = ExternalKey::for_location_id(&id)?;
    let externals = external_keys(row.get("external_ids"))?;
    let location = LocationRecord::from_row(row);

    let mut observations = Vec::new();
    let mut slots = Vec::new();
    if let Some(block) = row.get("availability").and_then(Value::as_object) {
        let checked = checked_time(block, source_name, record)?;
        if let Some(value) = univaf_availability(block, source_name, record)? {
            observations.push(RawObservation {
                checked,
                time_zone: location.timezone.clone(),
                value,
            });
        }
        if with_slots {
            slots = slots_of(block, checked, source_name, record)?;
        }
    }

    Ok(Interpretation::Record(Box::new(FeedRecord {
        primary,
        externals,
        location: Some(location),
        observations,
        slots,
    })))
}

fn univaf_log(
    row: &Map<String, Value>,
    source_name: &str,
    record: &Value,
    with_slots: bool,
) -> Result<Interpretation> {
    let Some(value) = univaf_availability(row, source_name, record)? else {
        return Ok(Interpretation::Skip(SkipReason::NoAvailability));
    };
    let id = scalar_id(row, "location_id", source_name, record)?;
    let primary = ExternalKey::uuid(&id)?;
    let checked = checked_time(row, source_name, record)?;
    let slots = if with_slots {
        slots_of(row, checked, source_name, record)?
    } else {
        Vec::new()
    };

    Ok(Interpretation::Record(Box::new(FeedRecord {
        primary,
        externals: Vec::new(),
        location: None,
        observations: vec![RawObservation {
            checked,
            time_zone: None,
            value,
        }],
        slots,
    })))
}

fn vaccinespotter(row: &Map<String, Value>, source_name: &str, record: &Value) -> Result<Interpretation> {
    let action = row.get("action").and_then(Value::as_str).unwrap_or_default();
    let block_field = match action {
        "UPDATE" => "data",
        "INSERT" => "changed_data",
        "DELETE" => "previous_data",
        other => return Ok(Interpretation::Skip(SkipReason::UnknownAction(other.to_string()))),
    };
    let Some(block) = row.get(block_field).and_then(Value::as_object) else {
        return Err(AvlError::malformed(
            source_name,
            format!("{action} entry without `{block_field}`"),
            record,
        ));
    };
    let id = scalar_id(block, "id", source_name, record)?;
    let primary = ExternalKey::from_parts(VACCINESPOTTER_SCHEME, &id)?;
    let location = LocationRecord::from_row(block);

    let mut observations = Vec::new();
    if action == "UPDATE" && touches_appointments(record) {
        let transaction = row.get("transaction_timestamp").and_then(Value::as_str);
        for field in ["previous_data", "data"] {
            let Some(observed) = row.get(field).filter(|b| b.is_object()) else {
                return Err(AvlError::malformed(
                    source_name,
                    format!("appointment change without `{field}`"),
                    record,
                ));
            };
            let mut observation = vaccinespotter_block(observed, transaction, source_name, record)?;
            if observation.time_zone.is_none() {
                observation.time_zone.clone_from(&location.timezone);
            }
            observations.push(observation);
        }
    }

    Ok(Interpretation::Record(Box::new(FeedRecord {
        primary,
        externals: Vec::new(),
        location: Some(location),
        observations,
        slots: Vec::new(),
    })))
}
