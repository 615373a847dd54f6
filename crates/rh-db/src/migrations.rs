//! Embedded SQL migrations and runner.
//!
//! Migrations are stored as `&str` constants and executed in order. A
//! `schema_migrations` table tracks which versions have been applied.
//!
//! Structural migrations are distinct from the *index format*
//! ([`INDEX_FORMAT`]), which versions the meaning of the stored rows. A
//! format change invalidates the index and forces a reindex instead of a
//! migration.

use rh_core::Result;
use rusqlite::Connection;

use crate::error::db_err;

/// Version of the semantics of stored rows (hashing scheme, metadata layout).
///
/// 2: metadata carries year, season and episode parsed from file names.
pub const INDEX_FORMAT: i64 = 2;

/// V1: entries and the store's key/value metadata.
const V1_INITIAL: &str = r#"
CREATE TABLE entries (
    id            TEXT PRIMARY KEY,
    path          TEXT NOT NULL UNIQUE,
    size          INTEGER NOT NULL,
    modified_at   TEXT NOT NULL,
    content_hash  TEXT NOT NULL DEFAULT '',
    metadata      TEXT,
    state         TEXT NOT NULL DEFAULT 'pending',
    error         TEXT,
    attempts      INTEGER NOT NULL DEFAULT 0,
    observed_at   TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    removed_at    TEXT
);

CREATE INDEX idx_entries_state ON entries(state);

CREATE TABLE store_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// V2: speeds up the purge sweep over soft-deleted rows.
const V2_REMOVED_INDEX: &str = r#"
CREATE INDEX idx_entries_removed_at ON entries(removed_at) WHERE state = 'removed';
"#;

/// Ordered list of all migrations.
const MIGRATIONS: &[(i64, &str)] = &[(1, V1_INITIAL), (2, V2_REMOVED_INDEX)];

/// Highest schema version this binary knows how to run against.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|&(v, _)| v).unwrap_or(0)
}

/// Highest schema version recorded in `conn`, or 0 for a fresh database.
pub fn current_version(conn: &Connection) -> Result<i64> {
    let exists: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_migrations'",
            [],
            |row| row.get(0),
        )
        .map_err(db_err)?;
    if !exists {
        return Ok(0);
    }
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .map_err(db_err)
}

/// Run all pending migrations on `conn`.
///
/// Creates the `schema_migrations` tracking table if it does not exist,
/// then applies every migration whose version is not yet recorded.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .map_err(db_err)?;

    for &(version, sql) in MIGRATIONS {
        let already: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        if already {
            continue;
        }

        tracing::debug!(version, "Applying migration");

        let tx = conn.unchecked_transaction().map_err(db_err)?;
        tx.execute_batch(sql).map_err(db_err)?;
        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [version],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
    }

    Ok(())
}

/// Drop every table, leaving an empty database ready for
/// [`run_migrations`].
pub fn drop_all(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "DROP TABLE IF EXISTS entries;
         DROP TABLE IF EXISTS store_meta;
         DROP TABLE IF EXISTS schema_migrations;",
    )
    .map_err(db_err)
}
