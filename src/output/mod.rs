//! Output tables: per-day interval CSVs, id/location snapshots, and the
//! multi-day slot aggregate.

pub mod aggregate;
pub mod csv_sink;
