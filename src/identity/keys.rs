//! External keys: scheme-tagged location identifiers and their normalization.
//!
//! An external key is `scheme:value`, e.g. `uuid:5c5c...`, `vtrcks:123` or
//! `univaf_v1:abc`. Keys are compared as plain strings after normalization;
//! nothing canonicalizes across schemes beyond the scrub below.

#![allow(missing_docs)]

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::errors::{AvlError, Result};

/// Scheme used for canonical location UUIDs.
pub const UUID_SCHEME: &str = "uuid";

/// Scheme used for pre-UUID location ids of the first API generation.
pub const LEGACY_ID_SCHEME: &str = "univaf_v0";

/// Scheme-tag marker of the versioned legacy external-id family.
const LEGACY_SCHEME_MARKER: &str = "univaf";

/// Byte offset and width of the index token in `univaf_vN_I:` keys.
const INDEX_TOKEN_START: usize = 9;
const INDEX_TOKEN_END: usize = 11;

fn scheme_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("scheme pattern compiles")
    })
}

/// A validated `scheme:value` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExternalKey(String);

impl ExternalKey {
    /// Parse and validate a raw key. The value part may itself contain `:`.
    pub fn parse(raw: &str) -> Result<Self> {
        let Some((scheme, value)) = raw.split_once(':') else {
            return Err(AvlError::MalformedKey {
                key: raw.to_string(),
                details: "missing `scheme:` prefix".to_string(),
            });
        };
        if !scheme_pattern().is_match(scheme) {
            return Err(AvlError::MalformedKey {
                key: raw.to_string(),
                details: format!("unrecognized scheme {scheme:?}"),
            });
        }
        if value.trim().is_empty() {
            return Err(AvlError::MalformedKey {
                key: raw.to_string(),
                details: "empty value".to_string(),
            });
        }
        Ok(Self(raw.to_string()))
    }

    /// Build a key from a provider system name and its id, scrubbing legacy
    /// versioned schemes on the way in.
    pub fn from_parts(system: &str, value: &str) -> Result<Self> {
        Self::parse(&scrub_legacy_key(&format!("{system}:{value}")))
    }

    /// The canonical key for a location id as handed out by the API: `uuid:`
    /// for v4 UUIDs, the first-generation legacy scheme otherwise.
    pub fn for_location_id(id: &str) -> Result<Self> {
        if is_uuid(id) {
            Self::parse(&format!("{UUID_SCHEME}:{id}"))
        } else {
            Self::parse(&format!("{LEGACY_ID_SCHEME}:{id}"))
        }
    }

    /// `uuid:<id>` without the v4 check, for feeds that only ever carry UUIDs.
    pub fn uuid(id: &str) -> Result<Self> {
        Self::parse(&format!("{UUID_SCHEME}:{id}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        self.0.split_once(':').map_or("", |(scheme, _)| scheme)
    }

    #[must_use]
    pub fn value(&self) -> &str {
        self.0.split_once(':').map_or("", |(_, value)| value)
    }
}

impl fmt::Display for ExternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ExternalKey {
    type Error = AvlError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ExternalKey> for String {
    fn from(value: ExternalKey) -> Self {
        value.0
    }
}

/// Remove the index token from `univaf_vN_I:` keys so ids from different API
/// generations collapse onto one key.
///
/// Applies only when the scheme tag mentions `univaf` and its last `_`-token
/// carries no `v` marker; the two bytes at offset 9..11 (`_I`) are dropped.
/// Keys whose bytes there are not `_<digit>` are left alone.
#[must_use]
pub fn scrub_legacy_key(key: &str) -> String {
    let scheme = key.split(':').next().unwrap_or(key);
    if !scheme.contains(LEGACY_SCHEME_MARKER) {
        return key.to_string();
    }
    let last_token = scheme.rsplit('_').next().unwrap_or(scheme);
    if last_token.contains('v') {
        return key.to_string();
    }
    match key.as_bytes().get(INDEX_TOKEN_START..INDEX_TOKEN_END) {
        Some([b'_', digit]) if digit.is_ascii_digit() => {
            format!("{}{}", &key[..INDEX_TOKEN_START], &key[INDEX_TOKEN_END..])
        }
        _ => key.to_string(),
    }
}

/// Whether `s` is a canonical lower-case hyphenated version-4 UUID.
#[must_use]
pub fn is_uuid(s: &str) -> bool {
    if s.len() != 36 {
        return false;
    }
    match Uuid::parse_str(s) {
        Ok(parsed) => {
            parsed.get_version_num() == 4 && parsed.hyphenated().to_string() == s
        }
        Err(_) => false,
    }
}

/// Candidate keys for one record: primary first, then the externals in
/// their original order, duplicates removed.
#[must_use]
pub fn candidate_keys(primary: &ExternalKey, externals: &[ExternalKey]) -> Vec<ExternalKey> {
    let mut out: Vec<ExternalKey> = Vec::with_capacity(externals.len() + 1);
    out.push(primary.clone());
    for key in externals {
        if !out.contains(key) {
            out.push(key.clone());
        }
    }
    out
}
