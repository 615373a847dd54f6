//! Key/value operations on `store_meta`.

use rh_core::Result;
use rusqlite::{Connection, OptionalExtension};

use crate::error::db_err;

pub const KEY_INDEX_FORMAT: &str = "index_format";
pub const KEY_CLEAN_SHUTDOWN: &str = "clean_shutdown";

pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM store_meta WHERE key = ?1",
        [key],
        |row| row.get(0),
    )
    .optional()
    .map_err(db_err)
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO store_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )
    .map_err(db_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;

    #[test]
    fn set_and_overwrite() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        assert_eq!(get_meta(&conn, KEY_INDEX_FORMAT).unwrap(), None);
        set_meta(&conn, KEY_INDEX_FORMAT, "1").unwrap();
        set_meta(&conn, KEY_INDEX_FORMAT, "2").unwrap();
        assert_eq!(
            get_meta(&conn, KEY_INDEX_FORMAT).unwrap().as_deref(),
            Some("2")
        );
    }
}
