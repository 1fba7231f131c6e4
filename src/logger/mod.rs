//! Activity logging: JSONL append-only plus an optional SQLite run ledger.

pub mod dual;
pub mod jsonl;
#[cfg(feature = "sqlite")]
pub mod sqlite;
