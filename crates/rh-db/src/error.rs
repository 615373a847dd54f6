//! Translation of SQLite failures into [`rh_core::Error`].
//!
//! Lock contention becomes [`Error::StoreBusy`] (retried by the store), damaged
//! files become [`Error::StoreCorrupt`], everything else is a plain database
//! error.

use rh_core::Error;
use rusqlite::ErrorCode;

/// Classify a rusqlite error.
pub fn db_err(e: rusqlite::Error) -> Error {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            Error::StoreBusy(e.to_string())
        }
        Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
            Error::StoreCorrupt(e.to_string())
        }
        _ => Error::database(e.to_string()),
    }
}

/// Classify a pool checkout failure.
///
/// r2d2 only exposes the message of the last connection error, so corruption
/// is recognised from SQLite's own wording.
pub fn pool_err(e: r2d2::Error) -> Error {
    let msg = e.to_string();
    if msg.contains("file is not a database") || msg.contains("malformed") {
        Error::StoreCorrupt(msg)
    } else if msg.contains("database is locked") {
        Error::StoreBusy(msg)
    } else {
        Error::database(format!("Failed to get connection from pool: {msg}"))
    }
}
