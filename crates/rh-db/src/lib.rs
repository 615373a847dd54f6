//! rh-db: the metadata store.
//!
//! SQLite-backed persistence for [`rh_core::MediaEntry`] records with
//! connection pooling, embedded migrations, index-format versioning and
//! corruption detection. [`Store`] is the handle every other component is
//! given; the `queries` modules are the raw per-connection operations it is
//! built from.

pub mod error;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;
pub mod store;

pub use store::{
    Listing, OpenReport, StateCounts, Store, StoreHealth, StoreOptions, UpsertOutcome,
};
