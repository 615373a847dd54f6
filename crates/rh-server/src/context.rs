//! Shared application context.
//!
//! [`AppContext`] is handed to every route handler via Axum state. The store
//! is synchronous, so handlers reach it through [`AppContext::store_call`],
//! which runs the closure on the blocking pool under the request deadline.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rh_core::config::Config;
use rh_core::events::EventBus;
use rh_core::{canonical_path, EntryId, EntryState, Error, MediaEntry, Result};
use rh_db::Store;

use crate::streaming::SessionRegistry;

#[derive(Clone)]
pub struct AppContext {
    pub store: Arc<Store>,
    pub config: Arc<Config>,
    pub event_bus: Arc<EventBus>,
    pub sessions: SessionRegistry,
}

impl AppContext {
    pub fn new(store: Arc<Store>, config: Arc<Config>, event_bus: Arc<EventBus>) -> Self {
        let sessions = SessionRegistry::new(event_bus.clone());
        Self {
            store,
            config,
            event_bus,
            sessions,
        }
    }

    /// Run `f` against the store on the blocking pool, bounded by the
    /// configured request timeout.
    pub async fn store_call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        store_call(&self.store, Some(self.config.server.request_timeout()), f).await
    }

    /// Find the live entry addressed by `id`: an entry UUID, or a path
    /// relative to one of the library roots (roots tried in config order).
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] if a relative path escapes its root.
    /// - [`Error::NotFound`] for unknown or removed entries.
    pub async fn resolve_entry(&self, id: &str) -> Result<MediaEntry> {
        let candidates = self.candidate_paths(id)?;
        let by_id = id.parse::<EntryId>().ok();
        let key = id.to_string();

        let found = self
            .store_call(move |store| {
                if let Some(entry_id) = by_id {
                    if let Some(entry) = store.get_by_id(entry_id)? {
                        if entry.state != EntryState::Removed {
                            return Ok(Some(entry));
                        }
                    }
                }
                for path in &candidates {
                    if let Some(entry) = store.get(path)? {
                        if entry.state != EntryState::Removed {
                            return Ok(Some(entry));
                        }
                    }
                }
                Ok(None)
            })
            .await?;

        found.ok_or_else(|| Error::not_found("entry", key))
    }

    fn candidate_paths(&self, id: &str) -> Result<Vec<PathBuf>> {
        let rel = Path::new(id.trim_start_matches('/'));
        for component in rel.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir => {
                    return Err(Error::Protocol(format!("path escapes library root: {id}")))
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(Error::Protocol(format!("path must be relative: {id}")))
                }
            }
        }
        if rel.as_os_str().is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .config
            .library
            .roots
            .iter()
            .map(|root| canonical_path(&root.join(rel)))
            .collect())
    }

    /// `path` relative to the library root that contains it.
    pub fn relative_path(&self, path: &Path) -> Option<PathBuf> {
        let root = self.config.library.root_of(path)?;
        path.strip_prefix(root).ok().map(Path::to_path_buf)
    }
}

/// Run `f` against `store` on the blocking pool, optionally under a deadline.
pub async fn store_call<T, F>(store: &Arc<Store>, deadline: Option<Duration>, f: F) -> Result<T>
where
    F: FnOnce(&Store) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    let task = tokio::task::spawn_blocking(move || f(&store));
    let joined = match deadline {
        Some(d) => tokio::time::timeout(d, task)
            .await
            .map_err(|_| Error::Timeout(format!("store call exceeded {d:?}")))?,
        None => task.await,
    };
    joined.map_err(|e| Error::Internal(format!("store task failed: {e}")))?
}
