//! Day-by-day run driver tying sources, identity, coalescing and output
//! together.

pub mod driver;

pub use driver::{Driver, RunOptions, RunSummary};
