#![forbid(unsafe_code)]

//! Availability ledger (avl): turns raw vaccine-availability feeds into
//! day-by-day interval tables keyed by stable internal location ids.
//!
//! Two cores do the work:
//! 1. **Identity resolution** maps every provider-specific external key onto
//!    one internal id, minting new ids and merging key sets as records show
//!    which keys belong together.
//! 2. **Interval coalescing** folds a stream of timestamped observations into
//!    `[first_seen, last_seen]` runs of an unchanged value, carrying open runs
//!    across day boundaries through checkpoints.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use availability_ledger::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use availability_ledger::core::config::Config;
//! use availability_ledger::pipeline::driver::{Driver, RunOptions};
//! ```

pub mod prelude;

pub mod coalesce;
pub mod core;
pub mod identity;
pub mod ingest;
pub mod logger;
pub mod output;
pub mod pipeline;
