//! Database query modules.

pub mod entries;
pub mod meta;
