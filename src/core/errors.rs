//! AVL-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, AvlError>;

/// Top-level error type for the availability ledger.
#[derive(Debug, Error)]
pub enum AvlError {
    #[error("[AVL-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[AVL-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[AVL-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[AVL-1004] invalid date range: {details}")]
    DateRange { details: String },

    #[error("[AVL-2001] malformed record in {source_name}: {details}\nProblem data:\n{record}")]
    MalformedRecord {
        source_name: String,
        details: String,
        record: String,
    },

    #[error("[AVL-2002] malformed external key {key:?}: {details}")]
    MalformedKey { key: String, details: String },

    #[error("[AVL-2003] external key not mapped to an internal id: {key}")]
    UnknownKey { key: String },

    #[error("[AVL-2004] internal id {id} has no location record")]
    MissingLocation { id: u64 },

    #[error("[AVL-2005] checkpoint {path} is corrupt: {details}")]
    CorruptCheckpoint { path: PathBuf, details: String },

    #[error("[AVL-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[AVL-2102] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[AVL-2103] CSV failure in {context}: {details}")]
    Csv {
        context: &'static str,
        details: String,
    },

    #[error("[AVL-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[AVL-3900] runtime failure: {details}")]
    Runtime { details: String },
}

/// What the run driver does when an error surfaces while handling one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Abort the whole run.
    Fatal,
    /// Log a warning, drop the record, keep going.
    SkipRecord,
}

impl AvlError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "AVL-1001",
            Self::MissingConfig { .. } => "AVL-1002",
            Self::ConfigParse { .. } => "AVL-1003",
            Self::DateRange { .. } => "AVL-1004",
            Self::MalformedRecord { .. } => "AVL-2001",
            Self::MalformedKey { .. } => "AVL-2002",
            Self::UnknownKey { .. } => "AVL-2003",
            Self::MissingLocation { .. } => "AVL-2004",
            Self::CorruptCheckpoint { .. } => "AVL-2005",
            Self::Serialization { .. } => "AVL-2101",
            Self::Sql { .. } => "AVL-2102",
            Self::Csv { .. } => "AVL-2103",
            Self::Io { .. } => "AVL-3002",
            Self::Runtime { .. } => "AVL-3900",
        }
    }

    /// Per-record handling: unresolvable keys are skipped, everything else
    /// stops the run before it can corrupt id or interval state.
    #[must_use]
    pub const fn disposition(&self) -> Disposition {
        match self {
            Self::MalformedKey { .. } | Self::UnknownKey { .. } => Disposition::SkipRecord,
            _ => Disposition::Fatal,
        }
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Build a malformed-record error carrying a pretty dump of the record.
    #[must_use]
    pub fn malformed(
        source_name: impl Into<String>,
        details: impl Into<String>,
        record: &serde_json::Value,
    ) -> Self {
        Self::MalformedRecord {
            source_name: source_name.into(),
            details: details.into(),
            record: serde_json::to_string_pretty(record).unwrap_or_else(|_| record.to_string()),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for AvlError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for AvlError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for AvlError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

impl From<csv::Error> for AvlError {
    fn from(value: csv::Error) -> Self {
        Self::Csv {
            context: "csv",
            details: value.to_string(),
        }
    }
}
