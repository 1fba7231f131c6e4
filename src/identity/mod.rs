//! Identity resolution: external keys, their normalization, and the id map.

pub mod keys;
pub mod resolver;
