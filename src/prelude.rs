//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use availability_ledger::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{AvlError, Disposition, Result};

// Identity
pub use crate::identity::keys::ExternalKey;
pub use crate::identity::resolver::{IdMap, IdPolicy, InternalId, MergeConflict, Resolution};

// Coalescing
pub use crate::coalesce::checkpoint::{FsStateStore, StateStore};
pub use crate::coalesce::interval::{ClosedInterval, Coalescer, FirstSight, OpenInterval, SlotTime};
pub use crate::coalesce::value::{Availability, SlotAvailability};

// Ingest
pub use crate::ingest::feed::Feed;
pub use crate::ingest::location::{LocationBook, LocationMerge, LocationRecord};
pub use crate::ingest::source::{FsRecordSource, RecordSource};

// Output and driver
pub use crate::output::aggregate::aggregate_slots;
pub use crate::pipeline::driver::{Driver, RunOptions, RunSummary};
