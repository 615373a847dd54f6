//! Row mapping between the `entries` table and [`MediaEntry`].

use chrono::{DateTime, SecondsFormat, Utc};
use rh_core::{EntryId, EntryState, MediaEntry, MediaMetadata};
use rusqlite::types::Type;
use std::path::PathBuf;
use uuid::Uuid;

/// Column list matching [`entry_from_row`].
pub const ENTRY_COLS: &str = "id, path, size, modified_at, content_hash, metadata, state,
    error, attempts, observed_at, updated_at, removed_at";

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

/// Render a timestamp for storage.
///
/// Fixed-width nanosecond RFC 3339 in UTC, so lexicographic order in SQL
/// matches chronological order and file mtimes round-trip exactly.
pub fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_err(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn parse_opt_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|v| {
        DateTime::parse_from_rfc3339(&v)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

fn parse_id(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<EntryId> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s)
        .map(EntryId::from)
        .map_err(|e| conversion_err(idx, e))
}

fn parse_state(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<EntryState> {
    let s: String = row.get(idx)?;
    s.parse::<EntryState>().map_err(|e| conversion_err(idx, e))
}

fn parse_metadata(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<MediaMetadata>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|json| serde_json::from_str(&json).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

// ---------------------------------------------------------------------------
// MediaEntry
// ---------------------------------------------------------------------------

/// Build a [`MediaEntry`] from a row selected with [`ENTRY_COLS`].
pub fn entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<MediaEntry> {
    let path: String = row.get(1)?;
    let size: i64 = row.get(2)?;
    let attempts: i64 = row.get(8)?;
    Ok(MediaEntry {
        id: parse_id(row, 0)?,
        path: PathBuf::from(path),
        size: size.max(0) as u64,
        modified_at: parse_ts(row, 3)?,
        content_hash: row.get(4)?,
        metadata: parse_metadata(row, 5)?,
        state: parse_state(row, 6)?,
        error: row.get(7)?,
        attempts: attempts.clamp(0, u32::MAX as i64) as u32,
        observed_at: parse_ts(row, 9)?,
        updated_at: parse_ts(row, 10)?,
        removed_at: parse_opt_ts(row, 11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_sort_lexicographically() {
        let a = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let b = a + chrono::Duration::nanoseconds(1);
        assert!(fmt_ts(&a) < fmt_ts(&b));
        assert_eq!(fmt_ts(&a).len(), fmt_ts(&b).len());
    }

    #[test]
    fn nanosecond_roundtrip() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let parsed = DateTime::parse_from_rfc3339(&fmt_ts(&ts))
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(parsed, ts);
    }
}
