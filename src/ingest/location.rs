//! Location records: descriptive attributes per internal id.
//!
//! Construction is a pure function of one raw row. Every field has a fixed
//! precedence list of source fields; the first usable one wins.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::errors::{AvlError, Result};
use crate::identity::keys::is_uuid;
use crate::identity::resolver::InternalId;

/// How a newly seen record is folded into an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LocationMerge {
    /// Keep every field once set; later records only fill gaps.
    #[default]
    FirstKnown,
    /// Later non-empty fields replace earlier ones.
    LastKnown,
}

/// Normalized descriptive attributes of one location.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub uuid: Option<String>,
    pub name: Option<String>,
    pub provider: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub county: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub timezone: Option<String>,
}

impl LocationRecord {
    /// Build a record from a raw provider row.
    #[must_use]
    pub fn from_row(row: &Map<String, Value>) -> Self {
        let (lat, lng) = position(row).unzip();
        let mut record = Self {
            uuid: text(row, "id").filter(|id| is_uuid(id)).map(str::to_string),
            name: text(row, "name").map(title_case),
            provider: first_text(row, &["provider", "brand"]).map(normalize_provider),
            kind: text(row, "location_type").map(str::to_lowercase),
            address: address(row),
            city: text(row, "city").map(title_case),
            county: text(row, "county").map(title_case),
            state: text(row, "state").map(str::to_uppercase),
            zip: text(row, "postal_code").and_then(zip5),
            lat,
            lng,
            timezone: text(row, "time_zone").map(str::to_string),
        };
        // Some NJ listings carry the whole "street, city, NJ zip" line.
        if let Some(address) = record.address.as_mut()
            && address.contains(", NJ")
            && let Some((street, _)) = address.split_once(", ")
        {
            *address = street.to_string();
        }
        record
    }

    /// Fold `other` into `self` field by field.
    pub fn merge(&mut self, other: Self, policy: LocationMerge) {
        fn pick<T>(slot: &mut Option<T>, incoming: Option<T>, policy: LocationMerge) {
            match policy {
                LocationMerge::FirstKnown => {
                    if slot.is_none() {
                        *slot = incoming;
                    }
                }
                LocationMerge::LastKnown => {
                    if incoming.is_some() {
                        *slot = incoming;
                    }
                }
            }
        }
        pick(&mut self.uuid, other.uuid, policy);
        pick(&mut self.name, other.name, policy);
        pick(&mut self.provider, other.provider, policy);
        pick(&mut self.kind, other.kind, policy);
        pick(&mut self.address, other.address, policy);
        pick(&mut self.city, other.city, policy);
        pick(&mut self.county, other.county, policy);
        pick(&mut self.state, other.state, policy);
        pick(&mut self.zip, other.zip, policy);
        pick(&mut self.lat, other.lat, policy);
        pick(&mut self.lng, other.lng, policy);
        pick(&mut self.timezone, other.timezone, policy);
    }
}

/// All known locations keyed by internal id.
#[derive(Debug, Clone, Default)]
pub struct LocationBook {
    records: BTreeMap<InternalId, LocationRecord>,
    policy: LocationMerge,
}

impl LocationBook {
    #[must_use]
    pub fn new(policy: LocationMerge) -> Self {
        Self {
            records: BTreeMap::new(),
            policy,
        }
    }

    /// Seed from a previous snapshot. Loaded records are taken as is.
    pub fn load<I>(&mut self, records: I)
    where
        I: IntoIterator<Item = (InternalId, LocationRecord)>,
    {
        self.records.extend(records);
    }

    /// Merge a freshly built record. Returns true when the id was new.
    pub fn merge(&mut self, id: InternalId, record: LocationRecord) -> bool {
        match self.records.get_mut(&id) {
            Some(existing) => {
                existing.merge(record, self.policy);
                false
            }
            None => {
                self.records.insert(id, record);
                true
            }
        }
    }

    #[must_use]
    pub fn get(&self, id: InternalId) -> Option<&LocationRecord> {
        self.records.get(&id)
    }

    /// Look up a location the caller requires to exist.
    pub fn lookup(&self, id: InternalId) -> Result<&LocationRecord> {
        self.records
            .get(&id)
            .ok_or(AvlError::MissingLocation { id })
    }

    pub fn iter(&self) -> impl Iterator<Item = (InternalId, &LocationRecord)> {
        self.records.iter().map(|(id, record)| (*id, record))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ──────────────────── field helpers ────────────────────

fn text<'a>(row: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    row.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn first_text<'a>(row: &'a Map<String, Value>, fields: &[&str]) -> Option<&'a str> {
    fields.iter().find_map(|field| text(row, field))
}

fn normalize_provider(raw: &str) -> String {
    let lower = raw.to_lowercase();
    if lower == "rite_aid" {
        "riteaid".to_string()
    } else {
        lower
    }
}

fn address(row: &Map<String, Value>) -> Option<String> {
    let from_lines = row
        .get("address_lines")
        .and_then(Value::as_array)
        .map(|lines| {
            lines
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(",")
        })
        .map(|joined| joined.strip_suffix(',').unwrap_or(&joined).trim().to_string())
        .filter(|joined| !joined.is_empty());
    from_lines.or_else(|| text(row, "address").map(str::to_string))
}

/// First five characters of a postal code as a zero-padded number.
fn zip5(raw: &str) -> Option<String> {
    let head: String = raw.chars().take(5).collect();
    head.parse::<u32>().ok().map(|zip| format!("{zip:05}"))
}

/// Upper-case the first letter of every alphabetic run, lower-case the rest.
#[must_use]
pub fn title_case(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut prev_alpha = false;
    for ch in raw.chars() {
        if prev_alpha {
            out.extend(ch.to_lowercase());
        } else {
            out.extend(ch.to_uppercase());
        }
        prev_alpha = ch.is_alphabetic();
    }
    out
}

fn coordinates(value: &Value) -> Option<(f64, f64)> {
    let obj = value.as_object()?;
    let lat = obj.get("latitude").and_then(Value::as_f64)?;
    let lng = obj.get("longitude").and_then(Value::as_f64)?;
    Some((lat, lng))
}

/// `(lat, lng)` from `position` (object or WKB hex) or `location`.
fn position(row: &Map<String, Value>) -> Option<(f64, f64)> {
    match row.get("position") {
        Some(Value::Object(_)) => row.get("position").and_then(coordinates),
        Some(Value::String(encoded)) => parse_wkb_point(encoded).map(|(lng, lat)| (lat, lng)),
        _ => None,
    }
    .or_else(|| row.get("location").and_then(coordinates))
}

const EWKB_SRID_FLAG: u32 = 0x2000_0000;
const WKB_POINT: u32 = 1;

/// Decode a hex WKB or PostGIS EWKB point into `(x, y)`, i.e. `(lng, lat)`.
#[must_use]
pub fn parse_wkb_point(encoded: &str) -> Option<(f64, f64)> {
    let bytes = hex::decode(encoded.trim()).ok()?;
    let little_endian = match bytes.first()? {
        0 => false,
        1 => true,
        _ => return None,
    };
    let read_u32 = |at: usize| -> Option<u32> {
        let raw: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
        Some(if little_endian {
            u32::from_le_bytes(raw)
        } else {
            u32::from_be_bytes(raw)
        })
    };
    let read_f64 = |at: usize| -> Option<f64> {
        let raw: [u8; 8] = bytes.get(at..at + 8)?.try_into().ok()?;
        Some(if little_endian {
            f64::from_le_bytes(raw)
        } else {
            f64::from_be_bytes(raw)
        })
    };

    let geometry = read_u32(1)?;
    if (geometry & 0x0FFF_FFFF) % 1000 != WKB_POINT {
        return None;
    }
    let mut at = 5;
    if geometry & EWKB_SRID_FLAG != 0 {
        at += 4;
    }
    Some((read_f64(at)?, read_f64(at + 8)?))
}
