//! rh-core: shared types, IDs, errors, configuration, and event system.
//!
//! This crate is the foundational dependency for all other rh-* crates. It
//! defines the media-library domain model ([`MediaEntry`], [`WatchEvent`]),
//! the unified [`Error`] type, application configuration, and a broadcast
//! event bus used to observe index and streaming activity.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod media;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, ErrorClass, Result};
pub use ids::*;
pub use media::*;
