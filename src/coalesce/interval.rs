//! Interval coalescer: collapses runs of unchanged observations into
//! `[first_seen, last_seen, value]` intervals.
//!
//! One open interval exists per key. An observation with the same value
//! extends it; a different value closes it (the closed record is returned)
//! and opens a new one. Open intervals survive the end of a run through the
//! checkpoint and are only emitted by an explicit flush.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::identity::resolver::InternalId;

/// What happens to an observation for a key with no prior state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FirstSight {
    /// Open a fresh interval.
    #[default]
    Open,
    /// Drop the observation; only keys carried in from a checkpoint are
    /// tracked.
    Skip,
}

/// Key for location-level intervals.
pub type LocationKey = InternalId;

/// Local start time of one appointment slot. Keeps its UTC offset so the
/// offset of slot intervals is recoverable from the key alone.
#[derive(Debug, Clone, Copy)]
pub struct SlotTime(DateTime<FixedOffset>);

impl SlotTime {
    /// Parse a local RFC 3339 slot start, e.g. `2021-05-01T09:30:00-04:00`.
    pub fn parse(raw: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(raw.trim()).ok().map(Self)
    }

    #[must_use]
    pub const fn from_datetime(local: DateTime<FixedOffset>) -> Self {
        Self(local)
    }

    #[must_use]
    pub fn local(&self) -> DateTime<FixedOffset> {
        self.0
    }

    /// UTC offset in whole hours.
    #[must_use]
    pub fn offset_hours(&self) -> i32 {
        self.0.offset().local_minus_utc() / 3600
    }

    /// UTC slot start, minute precision, as written to the slot table.
    #[must_use]
    pub fn utc_stamp(&self) -> String {
        self.0.naive_utc().format("%Y-%m-%d %H:%M").to_string()
    }
}

impl fmt::Display for SlotTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_rfc3339())
    }
}

// Equality and ordering follow the instant, then the offset, so equal
// instants written with different offsets stay distinct keys.
impl PartialEq for SlotTime {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for SlotTime {}

impl std::hash::Hash for SlotTime {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.naive_utc().hash(state);
        self.0.offset().local_minus_utc().hash(state);
    }
}

impl PartialOrd for SlotTime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SlotTime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .cmp(&other.0)
            .then_with(|| {
                self.0
                    .offset()
                    .local_minus_utc()
                    .cmp(&other.0.offset().local_minus_utc())
            })
    }
}

/// Key for slot-level intervals.
pub type SlotKey = (InternalId, SlotTime);

/// Truncate a UTC timestamp to whole seconds.
#[must_use]
pub fn to_second(ts: NaiveDateTime) -> NaiveDateTime {
    ts.with_nanosecond(0).unwrap_or(ts)
}

/// In-progress run of one unchanged value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenInterval<V> {
    pub first_seen: NaiveDateTime,
    pub last_seen: NaiveDateTime,
    pub utc_offset: i32,
    pub value: V,
}

/// A finished interval, the unit written to the output tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedInterval<K, V> {
    pub key: K,
    pub first_seen: NaiveDateTime,
    pub last_seen: NaiveDateTime,
    pub utc_offset: i32,
    pub value: V,
}

impl<K, V> ClosedInterval<K, V> {
    fn from_open(key: K, open: OpenInterval<V>) -> Self {
        Self {
            key,
            first_seen: open.first_seen,
            last_seen: open.last_seen,
            utc_offset: open.utc_offset,
            value: open.value,
        }
    }
}

/// Per-key open intervals plus the first-sight policy.
#[derive(Debug, Clone)]
pub struct Coalescer<K, V> {
    open: BTreeMap<K, OpenInterval<V>>,
    first_sight: FirstSight,
    out_of_order: u64,
}

impl<K, V> Coalescer<K, V>
where
    K: Ord + Clone,
    V: PartialEq + Clone,
{
    #[must_use]
    pub fn new(first_sight: FirstSight) -> Self {
        Self {
            open: BTreeMap::new(),
            first_sight,
            out_of_order: 0,
        }
    }

    /// Resume from checkpointed open intervals.
    #[must_use]
    pub fn with_state(first_sight: FirstSight, state: BTreeMap<K, OpenInterval<V>>) -> Self {
        Self {
            open: state,
            first_sight,
            out_of_order: 0,
        }
    }

    /// Feed one observation. Returns the interval it closed, if any.
    ///
    /// `last_seen` never moves backwards: an older timestamp with an
    /// unchanged value leaves the interval as is, and a changed value that
    /// arrives late opens its interval at the previous `last_seen`.
    pub fn observe(
        &mut self,
        key: K,
        checked: NaiveDateTime,
        utc_offset: i32,
        value: V,
    ) -> Option<ClosedInterval<K, V>> {
        let checked = to_second(checked);
        let Some(current) = self.open.get_mut(&key) else {
            if self.first_sight == FirstSight::Open {
                self.open.insert(
                    key,
                    OpenInterval {
                        first_seen: checked,
                        last_seen: checked,
                        utc_offset,
                        value,
                    },
                );
            }
            return None;
        };

        if checked < current.last_seen {
            self.out_of_order += 1;
        }

        if current.value == value {
            current.last_seen = current.last_seen.max(checked);
            return None;
        }

        let start = checked.max(current.last_seen);
        let replaced = std::mem::replace(
            current,
            OpenInterval {
                first_seen: start,
                last_seen: start,
                utc_offset,
                value,
            },
        );
        Some(ClosedInterval::from_open(key, replaced))
    }

    /// Emit every open interval unchanged and clear the state.
    pub fn flush(&mut self) -> Vec<ClosedInterval<K, V>> {
        std::mem::take(&mut self.open)
            .into_iter()
            .map(|(key, open)| ClosedInterval::from_open(key, open))
            .collect()
    }

    /// Open intervals, for checkpointing.
    #[must_use]
    pub fn state(&self) -> &BTreeMap<K, OpenInterval<V>> {
        &self.open
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<&OpenInterval<V>> {
        self.open.get(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.open.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Observations that arrived older than their key's `last_seen`.
    #[must_use]
    pub fn out_of_order(&self) -> u64 {
        self.out_of_order
    }
}
