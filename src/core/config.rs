//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::coalesce::interval::FirstSight;
use crate::core::errors::{AvlError, Result};
use crate::identity::resolver::{IdPolicy, MergeConflict};
use crate::ingest::feed::Feed;
use crate::ingest::location::LocationMerge;

/// Widest hash id that still fits comfortably in a `u64`.
pub const MAX_HASH_DIGITS: u32 = 18;

/// Full AVL configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub identity: IdentityConfig,
    pub coalesce: CoalesceConfig,
    pub locations: LocationsConfig,
    pub run: RunConfig,
}

/// Where raw input, output tables, checkpoints and logs live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub raw_dir: PathBuf,
    pub out_dir: PathBuf,
    pub state_dir: PathBuf,
    pub sqlite_db: PathBuf,
    pub jsonl_log: PathBuf,
}

/// Which id-minting scheme a deployment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdPolicyKind {
    #[default]
    Counter,
    Hash,
}

/// Identity resolution policy. Mixing policies across runs over one id map
/// corrupts it; the config hash is logged with every run to catch that.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IdentityConfig {
    pub id_policy: IdPolicyKind,
    /// Modulus exponent for hash-minted ids.
    pub hash_digits: u32,
    pub merge_conflict: MergeConflict,
}

/// Interval coalescing knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoalesceConfig {
    pub first_sight: FirstSight,
    /// Slot checkpoints drop slots dated more than this many days before the
    /// run date.
    pub slot_retention_days: u64,
    /// Emit open intervals after the last day of a range instead of
    /// checkpointing them.
    pub flush_on_last_day: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct LocationsConfig {
    pub merge_policy: LocationMerge,
}

/// Defaults for `avl process`; command-line flags win.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    pub feed: Feed,
    pub slots: bool,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[AVL-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("avl").join("config.toml");
        let data = home_dir.join(".local").join("share").join("avl");
        Self {
            config_file: cfg,
            raw_dir: data.join("raw"),
            out_dir: data.join("clean"),
            state_dir: data.join("state"),
            sqlite_db: data.join("ledger.sqlite3"),
            jsonl_log: data.join("activity.jsonl"),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            id_policy: IdPolicyKind::Counter,
            hash_digits: 8,
            merge_conflict: MergeConflict::Warn,
        }
    }
}

impl IdentityConfig {
    /// The resolver policy this section describes.
    #[must_use]
    pub const fn policy(&self) -> IdPolicy {
        match self.id_policy {
            IdPolicyKind::Counter => IdPolicy::Counter,
            IdPolicyKind::Hash => IdPolicy::Hash {
                digits: self.hash_digits,
            },
        }
    }
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            first_sight: FirstSight::Open,
            slot_retention_days: 1,
            flush_on_last_day: false,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            feed: Feed::UnivafSnapshot,
            slots: true,
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|e| AvlError::io(&path_buf, e))?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(AvlError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.normalize_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for the activity log.
    ///
    /// FNV-1a over the canonical JSON form, stable across processes and
    /// toolchain versions.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // paths
        set_env_path(&mut lookup, "AVL_RAW_DIR", &mut self.paths.raw_dir);
        set_env_path(&mut lookup, "AVL_OUT_DIR", &mut self.paths.out_dir);
        set_env_path(&mut lookup, "AVL_STATE_DIR", &mut self.paths.state_dir);
        set_env_path(&mut lookup, "AVL_SQLITE_DB", &mut self.paths.sqlite_db);
        set_env_path(&mut lookup, "AVL_JSONL_LOG", &mut self.paths.jsonl_log);

        // identity
        set_env_enum(&mut lookup, "AVL_ID_POLICY", &mut self.identity.id_policy)?;
        if let Some(raw) = lookup("AVL_HASH_DIGITS") {
            let digits = parse_env_u64("AVL_HASH_DIGITS", &raw)?;
            self.identity.hash_digits = u32::try_from(digits).map_err(|_| AvlError::ConfigParse {
                context: "env",
                details: format!("AVL_HASH_DIGITS={raw:?}: out of range"),
            })?;
        }
        set_env_enum(
            &mut lookup,
            "AVL_MERGE_CONFLICT",
            &mut self.identity.merge_conflict,
        )?;

        // coalesce
        set_env_enum(&mut lookup, "AVL_FIRST_SIGHT", &mut self.coalesce.first_sight)?;
        if let Some(raw) = lookup("AVL_SLOT_RETENTION_DAYS") {
            self.coalesce.slot_retention_days = parse_env_u64("AVL_SLOT_RETENTION_DAYS", &raw)?;
        }
        if let Some(raw) = lookup("AVL_FLUSH_ON_LAST_DAY") {
            self.coalesce.flush_on_last_day = parse_env_bool("AVL_FLUSH_ON_LAST_DAY", &raw)?;
        }

        // locations
        set_env_enum(
            &mut lookup,
            "AVL_LOCATION_MERGE",
            &mut self.locations.merge_policy,
        )?;

        // run
        set_env_enum(&mut lookup, "AVL_FEED", &mut self.run.feed)?;
        if let Some(raw) = lookup("AVL_SLOTS") {
            self.run.slots = parse_env_bool("AVL_SLOTS", &raw)?;
        }

        Ok(())
    }

    /// Expand a leading `~/` and strip trailing slashes (root stays `/`).
    fn normalize_paths(&mut self) {
        let home = env::var_os("HOME").map(PathBuf::from);
        for path in [
            &mut self.paths.raw_dir,
            &mut self.paths.out_dir,
            &mut self.paths.state_dir,
            &mut self.paths.sqlite_db,
            &mut self.paths.jsonl_log,
        ] {
            let s = path.to_string_lossy().into_owned();
            if let (Some(rest), Some(home)) = (s.strip_prefix("~/"), home.as_ref()) {
                *path = home.join(rest);
                continue;
            }
            if s.len() > 1
                && let Some(stripped) = s.strip_suffix('/')
            {
                *path = PathBuf::from(stripped);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if !(1..=MAX_HASH_DIGITS).contains(&self.identity.hash_digits) {
            return Err(AvlError::InvalidConfig {
                details: format!(
                    "identity.hash_digits must be in 1..={MAX_HASH_DIGITS}, got {}",
                    self.identity.hash_digits
                ),
            });
        }

        if self.coalesce.slot_retention_days > 366 {
            return Err(AvlError::InvalidConfig {
                details: format!(
                    "coalesce.slot_retention_days must be <= 366, got {}",
                    self.coalesce.slot_retention_days
                ),
            });
        }

        for (name, path) in [
            ("paths.raw_dir", &self.paths.raw_dir),
            ("paths.out_dir", &self.paths.out_dir),
            ("paths.state_dir", &self.paths.state_dir),
        ] {
            if path.as_os_str().is_empty() {
                return Err(AvlError::InvalidConfig {
                    details: format!("{name} must not be empty"),
                });
            }
        }

        if self.paths.out_dir == self.paths.raw_dir {
            return Err(AvlError::InvalidConfig {
                details: "paths.out_dir must differ from paths.raw_dir".to_string(),
            });
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn set_env_path<F>(lookup: &mut F, name: &str, slot: &mut PathBuf)
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = PathBuf::from(raw);
    }
}

/// Enum knobs take the same snake_case names as the TOML file.
fn set_env_enum<F, T>(lookup: &mut F, name: &str, slot: &mut T) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
    T: DeserializeOwned,
{
    if let Some(raw) = lookup(name) {
        *slot = serde_json::from_value(serde_json::Value::String(raw.trim().to_string()))
            .map_err(|error| AvlError::ConfigParse {
                context: "env",
                details: format!("{name}={raw:?}: {error}"),
            })?;
    }
    Ok(())
}

fn parse_env_u64(name: &str, raw: &str) -> Result<u64> {
    raw.trim().parse::<u64>().map_err(|error| AvlError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}

fn parse_env_bool(name: &str, raw: &str) -> Result<bool> {
    raw.trim().parse::<bool>().map_err(|error| AvlError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}
