//! Observed values: location-level availability and slot-level availability.
//!
//! Equality is exact. `Unavailable`, `Uncounted` and `Unknown` never compare
//! equal to each other, so a run of "no capacity" is never merged with a run
//! of "open, count unknown".

#![allow(missing_docs)]

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Availability of a location at one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Availability {
    /// The provider could not tell.
    Unknown,
    /// No capacity (written as `0`).
    Unavailable,
    /// Open with a known, positive number of appointments.
    Count(u64),
    /// Open, but the provider does not publish counts (written as `+`).
    Uncounted,
}

impl Availability {
    /// A count of zero is the same observation as "no capacity".
    #[must_use]
    pub const fn from_count(count: u64) -> Self {
        if count == 0 {
            Self::Unavailable
        } else {
            Self::Count(count)
        }
    }

    /// Whether the location had any capacity at all.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Count(_) | Self::Uncounted)
    }
}

/// CSV cell form: `""`, `0`, `<n>`, `+`.
impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => Ok(()),
            Self::Unavailable => f.write_str("0"),
            Self::Count(n) => write!(f, "{n}"),
            Self::Uncounted => f.write_str("+"),
        }
    }
}

impl Serialize for Availability {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Unknown => serializer.serialize_none(),
            Self::Unavailable => serializer.serialize_u64(0),
            Self::Count(n) => serializer.serialize_u64(*n),
            Self::Uncounted => serializer.serialize_str("+"),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAvailability {
    Count(u64),
    Float(f64),
    Text(String),
}

impl<'de> Deserialize<'de> for Availability {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Option::<RawAvailability>::deserialize(deserializer)? {
            None => Ok(Self::Unknown),
            Some(RawAvailability::Count(n)) => Ok(Self::from_count(n)),
            Some(RawAvailability::Float(x)) if x >= 0.0 && x.fract() == 0.0 => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let count = x as u64;
                Ok(Self::from_count(count))
            }
            Some(RawAvailability::Float(x)) => Err(serde::de::Error::custom(format!(
                "availability count must be a non-negative integer, got {x}"
            ))),
            Some(RawAvailability::Text(text)) => match text.as_str() {
                "+" => Ok(Self::Uncounted),
                "" => Ok(Self::Unknown),
                other => other.parse::<u64>().map(Self::from_count).map_err(|_| {
                    serde::de::Error::custom(format!("unrecognized availability {other:?}"))
                }),
            },
        }
    }
}

/// Whether one appointment slot was bookable at a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotAvailability {
    Open,
    Closed,
}

impl SlotAvailability {
    #[must_use]
    pub const fn as_flag(self) -> u8 {
        match self {
            Self::Open => 1,
            Self::Closed => 0,
        }
    }
}

impl fmt::Display for SlotAvailability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_flag())
    }
}

impl Serialize for SlotAvailability {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_flag())
    }
}

impl<'de> Deserialize<'de> for SlotAvailability {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            1 => Ok(Self::Open),
            0 => Ok(Self::Closed),
            other => Err(serde::de::Error::custom(format!(
                "slot availability must be 0 or 1, got {other}"
            ))),
        }
    }
}
