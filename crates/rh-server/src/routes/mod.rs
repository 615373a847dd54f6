//! Route handlers for the HTTP API.

pub mod entries;
pub mod health;
pub mod media;
pub mod sessions;
