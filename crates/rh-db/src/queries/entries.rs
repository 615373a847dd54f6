//! Media-entry operations.

use chrono::{DateTime, Utc};
use rh_core::{EntryId, EntryState, Error, MediaEntry, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

use crate::error::db_err;
use crate::models::{entry_from_row, fmt_ts, ENTRY_COLS};

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Insert or update the row for `entry.path`.
///
/// The write only lands if `entry.observed_at` is not older than the stored
/// row's. An existing row keeps its id. Returns the stored id, or `None`
/// when the write was superseded by a newer observation.
pub fn upsert_entry(conn: &Connection, entry: &MediaEntry) -> Result<Option<EntryId>> {
    let metadata = entry
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| Error::Internal(format!("metadata serialization: {e}")))?;
    let removed_at = entry.removed_at.as_ref().map(fmt_ts);

    let id: Option<String> = conn
        .query_row(
            "INSERT INTO entries (id, path, size, modified_at, content_hash, metadata, state,
                error, attempts, observed_at, updated_at, removed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(path) DO UPDATE SET
                size = excluded.size,
                modified_at = excluded.modified_at,
                content_hash = excluded.content_hash,
                metadata = excluded.metadata,
                state = excluded.state,
                error = excluded.error,
                attempts = excluded.attempts,
                observed_at = excluded.observed_at,
                updated_at = excluded.updated_at,
                removed_at = excluded.removed_at
             WHERE excluded.observed_at >= entries.observed_at
             RETURNING id",
            params![
                entry.id.to_string(),
                path_str(&entry.path),
                entry.size as i64,
                fmt_ts(&entry.modified_at),
                entry.content_hash,
                metadata,
                entry.state.as_str(),
                entry.error,
                entry.attempts as i64,
                fmt_ts(&entry.observed_at),
                fmt_ts(&Utc::now()),
                removed_at,
            ],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?;

    id.map(|s| {
        s.parse::<EntryId>()
            .map_err(|e| Error::database(format!("invalid entry id {s}: {e}")))
    })
    .transpose()
}

/// Get an entry by its path.
pub fn get_entry_by_path(conn: &Connection, path: &Path) -> Result<Option<MediaEntry>> {
    let q = format!("SELECT {ENTRY_COLS} FROM entries WHERE path = ?1");
    conn.query_row(&q, [path_str(path)], entry_from_row)
        .optional()
        .map_err(db_err)
}

/// Get an entry by its id.
pub fn get_entry_by_id(conn: &Connection, id: EntryId) -> Result<Option<MediaEntry>> {
    let q = format!("SELECT {ENTRY_COLS} FROM entries WHERE id = ?1");
    conn.query_row(&q, [id.to_string()], entry_from_row)
        .optional()
        .map_err(db_err)
}

/// Soft-delete the entry at `path`. Returns whether a live row was changed.
pub fn mark_removed(conn: &Connection, path: &Path, observed_at: DateTime<Utc>) -> Result<bool> {
    let now = fmt_ts(&Utc::now());
    let n = conn
        .execute(
            "UPDATE entries SET state = 'removed', removed_at = ?1, updated_at = ?1,
                observed_at = ?2
             WHERE path = ?3 AND state != 'removed' AND observed_at <= ?2",
            params![now, fmt_ts(&observed_at), path_str(path)],
        )
        .map_err(db_err)?;
    Ok(n > 0)
}

/// Soft-delete every live entry below directory `dir`. Returns the count.
pub fn mark_removed_under(
    conn: &Connection,
    dir: &Path,
    observed_at: DateTime<Utc>,
) -> Result<u64> {
    let mut prefix = path_str(dir);
    if !prefix.ends_with(std::path::MAIN_SEPARATOR) {
        prefix.push(std::path::MAIN_SEPARATOR);
    }
    let now = fmt_ts(&Utc::now());
    let n = conn
        .execute(
            "UPDATE entries SET state = 'removed', removed_at = ?1, updated_at = ?1,
                observed_at = ?2
             WHERE substr(path, 1, length(?3)) = ?3
               AND state != 'removed' AND observed_at <= ?2",
            params![now, fmt_ts(&observed_at), prefix],
        )
        .map_err(db_err)?;
    Ok(n as u64)
}

/// List entries, optionally filtered by state, ordered by path.
pub fn list_entries(conn: &Connection, state: Option<EntryState>) -> Result<Vec<MediaEntry>> {
    let q = format!(
        "SELECT {ENTRY_COLS} FROM entries WHERE (?1 IS NULL OR state = ?1) ORDER BY path ASC"
    );
    let mut stmt = conn.prepare(&q).map_err(db_err)?;
    let rows = stmt
        .query_map([state.map(|s| s.as_str())], entry_from_row)
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;
    Ok(rows)
}

/// Paths of every entry that is not `Removed`.
pub fn live_paths(conn: &Connection) -> Result<Vec<PathBuf>> {
    let mut stmt = conn
        .prepare("SELECT path FROM entries WHERE state != 'removed' ORDER BY path ASC")
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(db_err)?
        .map(|r| r.map(PathBuf::from))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;
    Ok(rows)
}

/// Number of entries per state.
pub fn count_by_state(conn: &Connection) -> Result<Vec<(EntryState, u64)>> {
    let mut stmt = conn
        .prepare("SELECT state, COUNT(*) FROM entries GROUP BY state")
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;

    let mut out = Vec::with_capacity(rows.len());
    for (state, count) in rows {
        out.push((state.parse::<EntryState>()?, count.max(0) as u64));
    }
    Ok(out)
}

/// Hard-delete `Removed` rows whose removal predates `before`.
pub fn purge_removed(conn: &Connection, before: DateTime<Utc>) -> Result<u64> {
    let n = conn
        .execute(
            "DELETE FROM entries WHERE state = 'removed' AND removed_at < ?1",
            [fmt_ts(&before)],
        )
        .map_err(db_err)?;
    Ok(n as u64)
}

/// Delete every entry.
pub fn delete_all(conn: &Connection) -> Result<u64> {
    let n = conn.execute("DELETE FROM entries", []).map_err(db_err)?;
    Ok(n as u64)
}
