//! Full resynchronization of the index against the library roots.
//!
//! Walks every root, submits `Created` for each media file found and
//! `Removed` for each live stored path that is no longer on disk. Unchanged
//! files cost one stat in the pipeline. Entries below a root that is
//! currently unavailable are left alone until the root returns.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rh_core::config::LibraryConfig;
use rh_core::events::{EventBus, EventPayload};
use rh_core::{canonical_path, Error, Result, WatchEvent};
use rh_db::Store;
use walkdir::WalkDir;

use crate::context::store_call;
use crate::indexer::Indexer;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub files_found: u64,
    pub removed: u64,
    pub roots_unavailable: usize,
}

/// Every media file below `dir` by canonical path, sorted and deduplicated.
pub fn walk_media(dir: &Path, library: &LibraryConfig) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unreadable path during walk");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| library.is_media(path))
        .map(|path| canonical_path(&path))
        .collect();
    files.sort();
    files.dedup();
    files
}

/// Walk all roots and reconcile the store through `indexer`.
pub async fn resync(
    store: &Arc<Store>,
    indexer: &Indexer,
    library: &LibraryConfig,
    events: &EventBus,
    reason: &str,
) -> Result<ResyncReport> {
    tracing::info!(%reason, roots = library.roots.len(), "Resync started");
    events.broadcast(EventPayload::ResyncStarted {
        reason: reason.to_string(),
    });

    let walk_library = library.clone();
    let (found, unavailable) = tokio::task::spawn_blocking(move || {
        let mut found = Vec::new();
        let mut unavailable = Vec::new();
        for root in &walk_library.roots {
            if root.is_dir() {
                found.extend(walk_media(root, &walk_library));
            } else {
                tracing::warn!(path = %root.display(), "Library root unavailable");
                unavailable.push(root.clone());
            }
        }
        (found, unavailable)
    })
    .await
    .map_err(|e| Error::Internal(format!("resync walk failed: {e}")))?;

    let live = store_call(store, None, |s| s.live_paths()).await?;
    let on_disk: HashSet<&Path> = found.iter().map(PathBuf::as_path).collect();
    let missing: Vec<PathBuf> = live
        .into_iter()
        .filter(|path| !on_disk.contains(path.as_path()))
        .filter(|path| !unavailable.iter().any(|root| path.starts_with(root)))
        .collect();

    let report = ResyncReport {
        files_found: found.len() as u64,
        removed: missing.len() as u64,
        roots_unavailable: unavailable.len(),
    };

    for path in missing {
        indexer.submit(WatchEvent::removed(path)).await?;
    }
    for path in found {
        indexer.submit(WatchEvent::created(path)).await?;
    }

    tracing::info!(
        files_found = report.files_found,
        removed = report.removed,
        "Resync submitted"
    );
    events.broadcast(EventPayload::ResyncCompleted {
        files_found: report.files_found,
        removed: report.removed,
    });
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_filters_media_and_recurses() {
        let dir = tempfile::tempdir().unwrap();
        let base = canonical_path(dir.path());
        std::fs::create_dir_all(base.join("album/disc1")).unwrap();
        std::fs::write(base.join("album/disc1/01.flac"), b"x").unwrap();
        std::fs::write(base.join("album/cover.jpg"), b"x").unwrap();
        std::fs::write(base.join("clip.MKV"), b"x").unwrap();

        let files = walk_media(&base, &LibraryConfig::default());
        assert_eq!(
            files,
            vec![base.join("album/disc1/01.flac"), base.join("clip.MKV")]
        );
    }

    #[cfg(unix)]
    #[test]
    fn walk_reports_symlinked_files_once() {
        let dir = tempfile::tempdir().unwrap();
        let base = canonical_path(dir.path());
        std::fs::create_dir_all(base.join("disc1")).unwrap();
        std::fs::write(base.join("disc1/01.wav"), b"x").unwrap();
        std::os::unix::fs::symlink(base.join("disc1"), base.join("alias")).unwrap();

        let files = walk_media(&base, &LibraryConfig::default());
        assert_eq!(files, vec![base.join("disc1/01.wav")]);
    }

    #[test]
    fn walk_of_missing_dir_is_empty() {
        assert!(walk_media(Path::new("/nonexistent/root"), &LibraryConfig::default()).is_empty());
    }
}
