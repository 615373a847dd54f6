//! The metadata store handle.
//!
//! [`Store`] owns the connection pool and is the only component that reads or
//! writes [`MediaEntry`] rows. It is synchronous; async callers run it on the
//! blocking pool.
//!
//! Writes for one path are serialized through a per-path lock map, writes for
//! different paths never wait on each other's locks. Lock contention inside
//! SQLite is retried with exponential backoff before `StoreBusy` surfaces.
//! A corruption error flips [`StoreHealth`] to `Corrupt`; after that every
//! operation answers `StoreRecovering` until [`Store::reset`] succeeds.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rh_core::config::StoreConfig;
use rh_core::{EntryId, EntryState, Error, MediaEntry, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::db_err;
use crate::migrations::{self, INDEX_FORMAT};
use crate::pool::{self, DbPool, PooledConnection};
use crate::queries::{entries, meta};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Tuning knobs for busy-retry behaviour.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub busy_retries: u32,
    pub busy_backoff: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from(&StoreConfig::default())
    }
}

impl From<&StoreConfig> for StoreOptions {
    fn from(cfg: &StoreConfig) -> Self {
        Self {
            busy_retries: cfg.busy_retries,
            busy_backoff: Duration::from_millis(cfg.busy_backoff_ms),
        }
    }
}

/// What [`Store::open`] found on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenReport {
    /// No usable database existed; a new one was created.
    pub created: bool,
    /// The previous process did not close the store.
    pub unclean_shutdown: bool,
    /// The file failed its integrity check and was recreated.
    pub recovered_from_corruption: bool,
    /// Stored rows were discarded; the library must be walked again.
    pub reindex_required: bool,
}

/// Result of [`Store::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The row was written; carries the stored (possibly pre-existing) id.
    Applied(EntryId),
    /// A newer observation for the path is already stored.
    Superseded,
}

/// Health of the store as observed by the coordinator and `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreHealth {
    Healthy,
    /// Being wiped and re-seeded.
    Recovering,
    /// A corruption error was seen; waiting for a reset.
    Corrupt,
}

impl StoreHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreHealth::Healthy => "healthy",
            StoreHealth::Recovering => "recovering",
            StoreHealth::Corrupt => "corrupt",
        }
    }
}

/// Number of entries in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub pending: u64,
    pub indexed: u64,
    pub stale: u64,
    pub removed: u64,
}

impl StateCounts {
    /// Entries that are not `Removed`.
    pub fn live(&self) -> u64 {
        self.pending + self.indexed + self.stale
    }
}

/// A point-in-time snapshot of entries.
///
/// The snapshot is owned, so writes made after it was taken never show up in
/// it, and [`Listing::iter`] can be called any number of times.
#[derive(Debug, Clone)]
pub struct Listing {
    entries: Arc<Vec<MediaEntry>>,
    taken_at: DateTime<Utc>,
}

impl Listing {
    fn new(entries: Vec<MediaEntry>) -> Self {
        Self {
            entries: Arc::new(entries),
            taken_at: Utc::now(),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MediaEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }
}

impl<'a> IntoIterator for &'a Listing {
    type Item = &'a MediaEntry;
    type IntoIter = std::slice::Iter<'a, MediaEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Backing {
    File(PathBuf),
    ReadOnly(PathBuf),
    Memory,
}

/// Handle to the metadata store.
#[derive(Debug)]
pub struct Store {
    backing: Backing,
    pool: RwLock<DbPool>,
    path_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
    options: StoreOptions,
    health: watch::Sender<StoreHealth>,
    closed: AtomicBool,
}

impl Store {
    /// Open (or create) the store at `path`.
    ///
    /// A file that is not a database, or that fails `quick_check` after an
    /// unclean shutdown, is recreated. A missing or mismatched index format
    /// wipes the stored entries. Both cases set
    /// [`OpenReport::reindex_required`]. Anything that still prevents opening
    /// is returned as an error.
    pub fn open(path: &Path, options: StoreOptions) -> Result<(Self, OpenReport)> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut report = OpenReport {
            created: !path.exists(),
            ..Default::default()
        };

        if !report.created {
            match inspect_file(path) {
                Ok(clean) => report.unclean_shutdown = !clean,
                Err(Error::StoreCorrupt(msg)) => {
                    tracing::warn!(path = %path.display(), "Store failed integrity check, recreating: {msg}");
                    remove_db_files(path)?;
                    report.created = true;
                    report.recovered_from_corruption = true;
                    report.reindex_required = true;
                }
                Err(e) => return Err(e),
            }
        }

        let pool = match pool::init_pool(path) {
            Ok(pool) => pool,
            Err(Error::StoreCorrupt(msg)) => {
                tracing::warn!(path = %path.display(), "Store unreadable, recreating: {msg}");
                remove_db_files(path)?;
                report.created = true;
                report.recovered_from_corruption = true;
                report.reindex_required = true;
                pool::init_pool(path)?
            }
            Err(e) => return Err(e),
        };

        let store = Self::from_pool(Backing::File(path.to_path_buf()), pool, options);
        store.prepare(&mut report)?;

        tracing::info!(
            path = %path.display(),
            created = report.created,
            unclean_shutdown = report.unclean_shutdown,
            reindex_required = report.reindex_required,
            "Store opened"
        );
        Ok((store, report))
    }

    /// Open an existing store for reading only.
    ///
    /// No integrity check, migration or meta write happens, and [`Store::close`]
    /// is a no-op, so the shutdown marker of a store another process is
    /// serving stays as it was. Every write fails with the database error.
    pub fn open_read_only(path: &Path, options: StoreOptions) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::not_found("store", path.display()));
        }
        let pool = pool::init_read_only_pool(path)?;
        let store = Self::from_pool(Backing::ReadOnly(path.to_path_buf()), pool, options);
        let conn = store.conn()?;
        let version = migrations::current_version(&conn)?;
        if version != migrations::latest_version() {
            return Err(Error::Validation(format!(
                "store schema version {version} does not match {}",
                migrations::latest_version()
            )));
        }
        Ok(store)
    }

    /// Open a fresh in-memory store.
    pub fn open_in_memory(options: StoreOptions) -> Result<Self> {
        let pool = pool::init_memory_pool()?;
        let store = Self::from_pool(Backing::Memory, pool, options);
        let mut report = OpenReport {
            created: true,
            ..Default::default()
        };
        store.prepare(&mut report)?;
        Ok(store)
    }

    fn from_pool(backing: Backing, pool: DbPool, options: StoreOptions) -> Self {
        let (health, _) = watch::channel(StoreHealth::Healthy);
        Self {
            backing,
            pool: RwLock::new(pool),
            path_locks: DashMap::new(),
            options,
            health,
            closed: AtomicBool::new(false),
        }
    }

    /// Check schema version and index format, then mark the store open.
    fn prepare(&self, report: &mut OpenReport) -> Result<()> {
        let conn = self.conn()?;

        let version = migrations::current_version(&conn)?;
        if version > migrations::latest_version() {
            tracing::warn!(
                version,
                known = migrations::latest_version(),
                "Store schema is newer than this binary; wiping"
            );
            migrations::drop_all(&conn)?;
            migrations::run_migrations(&conn)?;
            report.reindex_required = true;
        }

        let format = meta::get_meta(&conn, meta::KEY_INDEX_FORMAT)?;
        let expected = INDEX_FORMAT.to_string();
        match format {
            Some(ref f) if *f == expected => {}
            None if report.created => {}
            other => {
                tracing::warn!(
                    found = other.as_deref().unwrap_or("none"),
                    expected = %expected,
                    "Index format mismatch; discarding stored entries"
                );
                entries::delete_all(&conn)?;
                report.reindex_required = true;
            }
        }
        meta::set_meta(&conn, meta::KEY_INDEX_FORMAT, &expected)?;
        meta::set_meta(&conn, meta::KEY_CLEAN_SHUTDOWN, "0")?;
        Ok(())
    }

    // -- plumbing -----------------------------------------------------------

    fn conn(&self) -> Result<PooledConnection> {
        let pool = self.pool.read().clone();
        pool::get_conn(&pool)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Internal("store is closed".into()));
        }
        match *self.health.borrow() {
            StoreHealth::Healthy => Ok(()),
            StoreHealth::Recovering | StoreHealth::Corrupt => Err(Error::StoreRecovering),
        }
    }

    /// Run `f` on a pooled connection, retrying while the database is busy.
    fn run<T>(&self, op: &'static str, f: impl Fn(&Connection) -> Result<T>) -> Result<T> {
        self.ensure_available()?;
        let mut attempt: u32 = 0;
        loop {
            match self.conn().and_then(|conn| f(&conn)) {
                Err(Error::StoreBusy(msg)) if attempt < self.options.busy_retries => {
                    attempt += 1;
                    let delay = self
                        .options
                        .busy_backoff
                        .saturating_mul(1u32 << (attempt - 1).min(10));
                    tracing::debug!(op, attempt, "Store busy, retrying in {delay:?}: {msg}");
                    std::thread::sleep(delay);
                }
                Err(Error::StoreCorrupt(msg)) => {
                    self.flag_corrupt(op, &msg);
                    return Err(Error::StoreCorrupt(msg));
                }
                other => return other,
            }
        }
    }

    fn flag_corrupt(&self, op: &str, msg: &str) {
        let was = self.health.send_replace(StoreHealth::Corrupt);
        if was == StoreHealth::Healthy {
            tracing::error!(op, "Store corruption detected: {msg}");
        }
    }

    /// Flip the store to `Corrupt` as a detected corruption would.
    ///
    /// Lets callers outside this crate exercise their recovery path.
    #[doc(hidden)]
    pub fn simulate_corruption(&self, reason: &str) {
        self.flag_corrupt("simulated", reason);
    }

    /// Serialize `f` against every other write to `path`.
    fn with_path_lock<T>(&self, path: &Path, f: impl FnOnce() -> T) -> T {
        let lock = self
            .path_locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock();
            f()
        };
        drop(lock);
        self.path_locks
            .remove_if(path, |_, l| Arc::strong_count(l) == 1);
        result
    }

    #[cfg(test)]
    pub(crate) fn path_lock_count(&self) -> usize {
        self.path_locks.len()
    }

    // -- entry operations ---------------------------------------------------

    /// Write `entry`, unless a newer observation of its path is stored.
    pub fn upsert(&self, entry: &MediaEntry) -> Result<UpsertOutcome> {
        self.with_path_lock(&entry.path, || {
            let stored = self.run("upsert", |conn| entries::upsert_entry(conn, entry))?;
            Ok(match stored {
                Some(id) => UpsertOutcome::Applied(id),
                None => {
                    tracing::debug!(path = %entry.path.display(), "Upsert superseded by newer observation");
                    UpsertOutcome::Superseded
                }
            })
        })
    }

    pub fn get(&self, path: &Path) -> Result<Option<MediaEntry>> {
        self.run("get", |conn| entries::get_entry_by_path(conn, path))
    }

    pub fn get_by_id(&self, id: EntryId) -> Result<Option<MediaEntry>> {
        self.run("get_by_id", |conn| entries::get_entry_by_id(conn, id))
    }

    /// Soft-delete `path`. Returns whether a live entry was found.
    pub fn mark_removed(&self, path: &Path, observed_at: DateTime<Utc>) -> Result<bool> {
        self.with_path_lock(path, || {
            self.run("mark_removed", |conn| {
                entries::mark_removed(conn, path, observed_at)
            })
        })
    }

    /// Soft-delete everything below directory `dir`.
    pub fn mark_removed_under(&self, dir: &Path, observed_at: DateTime<Utc>) -> Result<u64> {
        self.with_path_lock(dir, || {
            self.run("mark_removed_under", |conn| {
                entries::mark_removed_under(conn, dir, observed_at)
            })
        })
    }

    /// Snapshot of every `Indexed` entry.
    pub fn list_indexed(&self) -> Result<Listing> {
        self.list_by_state(Some(EntryState::Indexed))
    }

    /// Snapshot of entries in `state`, or of all entries.
    pub fn list_by_state(&self, state: Option<EntryState>) -> Result<Listing> {
        self.run("list", |conn| entries::list_entries(conn, state))
            .map(Listing::new)
    }

    pub fn live_paths(&self) -> Result<Vec<PathBuf>> {
        self.run("live_paths", entries::live_paths)
    }

    pub fn counts(&self) -> Result<StateCounts> {
        let rows = self.run("counts", entries::count_by_state)?;
        let mut counts = StateCounts::default();
        for (state, n) in rows {
            match state {
                EntryState::Pending => counts.pending = n,
                EntryState::Indexed => counts.indexed = n,
                EntryState::Stale => counts.stale = n,
                EntryState::Removed => counts.removed = n,
            }
        }
        Ok(counts)
    }

    /// Hard-delete `Removed` rows removed before `before`.
    pub fn purge_removed(&self, before: DateTime<Utc>) -> Result<u64> {
        self.run("purge_removed", |conn| entries::purge_removed(conn, before))
    }

    // -- lifecycle ----------------------------------------------------------

    pub fn health(&self) -> StoreHealth {
        *self.health.borrow()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<StoreHealth> {
        self.health.subscribe()
    }

    /// Discard every entry and rebuild the schema.
    ///
    /// Operations answer `StoreRecovering` while this runs. If the tables
    /// cannot be dropped the database file is recreated. On success the store
    /// is healthy and empty.
    pub fn reset(&self) -> Result<()> {
        self.health.send_replace(StoreHealth::Recovering);
        tracing::warn!("Resetting store");

        let wiped = self.conn().and_then(|conn| {
            let tx = conn.unchecked_transaction().map_err(db_err)?;
            migrations::drop_all(&tx)?;
            tx.commit().map_err(db_err)?;
            migrations::run_migrations(&conn)
        });

        if let Err(e) = wiped {
            tracing::warn!("In-place reset failed, rebuilding database: {e}");
            if let Err(e) = self.rebuild_backing() {
                self.health.send_replace(StoreHealth::Corrupt);
                return Err(e);
            }
        }

        let conn = self.conn()?;
        meta::set_meta(&conn, meta::KEY_INDEX_FORMAT, &INDEX_FORMAT.to_string())?;
        meta::set_meta(&conn, meta::KEY_CLEAN_SHUTDOWN, "0")?;

        self.health.send_replace(StoreHealth::Healthy);
        tracing::info!("Store reset complete");
        Ok(())
    }

    fn rebuild_backing(&self) -> Result<()> {
        let mut pool = self.pool.write();
        *pool = match &self.backing {
            Backing::File(path) => {
                remove_db_files(path)?;
                pool::init_pool(path)?
            }
            Backing::Memory => pool::init_memory_pool()?,
            Backing::ReadOnly(_) => {
                return Err(Error::Internal("read-only store cannot be rebuilt".into()))
            }
        };
        Ok(())
    }

    /// Record a clean shutdown and checkpoint the WAL. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if matches!(self.backing, Backing::ReadOnly(_)) {
            return Ok(());
        }
        let conn = self.conn()?;
        meta::set_meta(&conn, meta::KEY_CLEAN_SHUTDOWN, "1")?;
        if matches!(self.backing, Backing::File(_)) {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
                .map_err(db_err)?;
        }
        tracing::info!("Store closed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File inspection
// ---------------------------------------------------------------------------

/// Open `path` directly and decide whether it is usable.
///
/// Returns whether the previous shutdown was clean. A file that is not a
/// database, or that fails `quick_check` after an unclean shutdown, yields
/// `StoreCorrupt`.
fn inspect_file(path: &Path) -> Result<bool> {
    let conn = Connection::open(path).map_err(db_err)?;

    let has_meta: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='store_meta'",
            [],
            |row| row.get(0),
        )
        .map_err(db_err)?;
    if !has_meta {
        return Ok(true);
    }

    let clean = meta::get_meta(&conn, meta::KEY_CLEAN_SHUTDOWN)?.as_deref() == Some("1");
    if clean {
        return Ok(true);
    }

    tracing::info!(path = %path.display(), "Previous shutdown was unclean; running quick_check");
    let mut stmt = conn.prepare("PRAGMA quick_check").map_err(db_err)?;
    let problems = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;
    if problems.len() == 1 && problems[0] == "ok" {
        Ok(false)
    } else {
        Err(Error::StoreCorrupt(problems.join("; ")))
    }
}

fn remove_db_files(path: &Path) -> Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        match std::fs::remove_file(PathBuf::from(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
