//! Interval coalescing: observed values, the per-key state machine, and the
//! day-to-day checkpoint.

pub mod checkpoint;
pub mod interval;
pub mod value;
