//! Observation extraction from raw provider rows.
//!
//! Everything here is a pure function of one JSON value. Shape problems in a
//! row that carries availability are fatal (`AVL-2001`) and carry the row.

#![allow(missing_docs)]

use chrono::{DateTime, NaiveDateTime, Offset, TimeZone};
use chrono_tz::Tz;
use serde_json::{Map, Value};

use crate::coalesce::interval::{SlotTime, to_second};
use crate::coalesce::value::{Availability, SlotAvailability};
use crate::core::errors::{AvlError, Result};
use crate::identity::keys::ExternalKey;

/// A checked time in UTC plus the whole-hour offset the source stamped on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckTime {
    pub utc: NaiveDateTime,
    pub source_offset: i32,
}

/// A location-level observation before id resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObservation {
    pub checked: CheckTime,
    pub time_zone: Option<String>,
    pub value: Availability,
}

/// Parse a provider timestamp.
///
/// Accepts RFC 3339 (`2021-05-01T12:00:00Z`, `...-04:00`), the PostgreSQL
/// text form (`2021-05-01 12:00:00.123+00`) and naive stamps, which are
/// taken as UTC. Sub-second precision is dropped.
#[must_use]
pub fn parse_checked_time(raw: &str) -> Option<CheckTime> {
    let raw = raw.trim();
    let aware = DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z"))
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%#z"));
    if let Ok(dt) = aware {
        return Some(CheckTime {
            utc: to_second(dt.naive_utc()),
            source_offset: dt.offset().local_minus_utc() / 3600,
        });
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|utc| CheckTime {
            utc: to_second(utc),
            source_offset: 0,
        })
}

/// Whole-hour UTC offset of `tz` at `utc`, or `fallback` when the zone is
/// absent or not a known IANA name.
#[must_use]
pub fn utc_offset_hours(utc: NaiveDateTime, tz: Option<&str>, fallback: i32) -> i32 {
    tz.and_then(|name| name.trim().parse::<Tz>().ok())
        .map_or(fallback, |zone| {
            zone.offset_from_utc_datetime(&utc).fix().local_minus_utc() / 3600
        })
}

// ──────────────────── univaf ────────────────────

/// Availability of a univaf availability block.
///
/// `Ok(None)` means the block carries no `available` field and the row holds
/// no observation at all.
pub fn univaf_availability(
    block: &Map<String, Value>,
    source_name: &str,
    record: &Value,
) -> Result<Option<Availability>> {
    let available = match block.get("available") {
        None | Some(Value::Null) => return Ok(None),
        Some(value) => value,
    };
    match available.as_str() {
        Some("YES" | "yes") => open_availability(block, source_name, record).map(Some),
        Some("NO" | "no") => Ok(Some(Availability::Unavailable)),
        Some("UNKNOWN") => Ok(Some(Availability::Unknown)),
        _ => Err(AvlError::malformed(
            source_name,
            format!("unrecognized availability value {available}"),
            record,
        )),
    }
}

fn open_availability(
    block: &Map<String, Value>,
    source_name: &str,
    record: &Value,
) -> Result<Availability> {
    if let Some(count) = block.get("available_count").filter(|v| !v.is_null()) {
        return count
            .as_u64()
            .map(Availability::from_count)
            .ok_or_else(|| {
                AvlError::malformed(source_name, "available_count is not a count", record)
            });
    }

    let capacity = block
        .get("capacity")
        .or_else(|| block.get("meta").and_then(|meta| meta.get("capacity")))
        .and_then(Value::as_array);
    let Some(capacity) = capacity else {
        return Ok(Availability::Uncounted);
    };
    // An empty capacity list sums to zero.
    if capacity.is_empty() {
        return Ok(Availability::Unavailable);
    }
    // Capacity entries reporting YES/NO instead of numbers carry no count.
    if matches!(
        capacity[0].get("available").and_then(Value::as_str),
        Some("YES" | "NO")
    ) {
        return Ok(Availability::Uncounted);
    }

    let mut total = 0_u64;
    for entry in capacity {
        let count = entry
            .get("available_count")
            .and_then(Value::as_u64)
            .or_else(|| entry.get("available").and_then(Value::as_u64))
            .ok_or_else(|| {
                AvlError::malformed(source_name, "capacity entry has no availability count", record)
            })?;
        total = total.saturating_add(count);
    }
    Ok(Availability::from_count(total))
}

/// Slot observations from a univaf availability block.
pub fn univaf_slots(
    block: &Map<String, Value>,
    source_name: &str,
    record: &Value,
) -> Result<Vec<(SlotTime, SlotAvailability)>> {
    let Some(slots) = block.get("slots").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    slots
        .iter()
        .map(|slot| {
            let start = slot
                .get("start")
                .and_then(Value::as_str)
                .and_then(SlotTime::parse)
                .ok_or_else(|| {
                    AvlError::malformed(source_name, "slot without a parseable start", record)
                })?;
            let available = if slot.get("available").and_then(Value::as_str) == Some("YES") {
                SlotAvailability::Open
            } else {
                SlotAvailability::Closed
            };
            Ok((start, available))
        })
        .collect()
}

/// Keys from an `external_ids` field: either `{system: value}` or
/// `[[system, value], ...]`. Values may be strings or numbers.
pub fn external_keys(value: Option<&Value>) -> Result<Vec<ExternalKey>> {
    fn scalar(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
    fn malformed(value: &Value) -> AvlError {
        AvlError::MalformedKey {
            key: value.to_string(),
            details: "external id is not a system/value pair".to_string(),
        }
    }

    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(system, value)| {
                let value = scalar(value).ok_or_else(|| malformed(value))?;
                ExternalKey::from_parts(system, &value)
            })
            .collect(),
        Some(Value::Array(pairs)) => pairs
            .iter()
            .map(|pair| match pair.as_array().map(Vec::as_slice) {
                Some([system, value]) => {
                    let system = system.as_str().ok_or_else(|| malformed(pair))?;
                    let value = scalar(value).ok_or_else(|| malformed(pair))?;
                    ExternalKey::from_parts(system, &value)
                }
                _ => Err(malformed(pair)),
            })
            .collect(),
        Some(other) => Err(malformed(other)),
    }
}

// ──────────────────── vaccinespotter ────────────────────

/// Whether a change-log entry touched appointment data.
#[must_use]
pub fn touches_appointments(entry: &Value) -> bool {
    entry
        .get("changed_data")
        .and_then(Value::as_object)
        .is_some_and(|changed| {
            changed.contains_key("appointments") || changed.contains_key("appointments_available")
        })
}

/// Observation from one `previous_data` / `data` block of a change entry.
pub fn vaccinespotter_block(
    block: &Value,
    transaction_timestamp: Option<&str>,
    source_name: &str,
    record: &Value,
) -> Result<RawObservation> {
    let stamp = ["appointments_last_fetched", "updated_at"]
        .iter()
        .find_map(|field| block.get(*field).and_then(Value::as_str))
        .or(transaction_timestamp)
        .ok_or_else(|| AvlError::malformed(source_name, "change entry has no timestamp", record))?;
    let checked = parse_checked_time(stamp).ok_or_else(|| {
        AvlError::malformed(source_name, format!("unparseable timestamp {stamp:?}"), record)
    })?;

    let value = if block
        .get("appointments_available")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        match block.get("appointments").and_then(Value::as_array) {
            Some(appointments) => Availability::from_count(appointments.len() as u64),
            None => Availability::Uncounted,
        }
    } else {
        Availability::Unavailable
    };

    let time_zone = block
        .get("time_zone")
        .and_then(Value::as_str)
        .filter(|tz| !tz.trim().is_empty())
        .map(str::to_string);

    Ok(RawObservation {
        checked,
        time_zone,
        value,
    })
}

/// Undo the doubled backslashes the change-log dump writes inside strings.
#[must_use]
pub fn repair_backslashes(line: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len());
    let mut i = 0;
    while i < line.len() {
        if line[i] == b'\\' && line.get(i + 1) == Some(&b'\\') {
            out.push(b'\\');
            i += 2;
        } else {
            out.push(line[i]);
            i += 1;
        }
    }
    out
}
