//! Raw feed input: file discovery, decoding, and per-feed interpretation into
//! external keys, location records, and observations.

pub mod feed;
pub mod location;
pub mod normalize;
pub mod source;
