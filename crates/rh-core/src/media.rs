//! Media-library domain types.
//!
//! [`MediaEntry`] is the unit the store persists; [`WatchEvent`] is the unit
//! the watcher produces and the indexer consumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::ids::EntryId;

/// Extensions treated as media when no explicit list is configured.
pub const DEFAULT_MEDIA_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "opus", "wav", "m4a", "aac", "mkv", "mp4", "m4v", "webm", "avi",
    "mov", "ts", "m2ts",
];

// ---------------------------------------------------------------------------
// EntryState
// ---------------------------------------------------------------------------

/// Lifecycle state of a [`MediaEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    /// Seen by the watcher, metadata not (yet) extracted.
    Pending,
    /// Metadata extracted; servable.
    Indexed,
    /// Modified since indexing; prior metadata retained until re-indexed.
    Stale,
    /// Soft-deleted; purged after the retention period.
    Removed,
}

impl EntryState {
    /// All states, in lifecycle order.
    pub const ALL: [EntryState; 4] = [
        EntryState::Pending,
        EntryState::Indexed,
        EntryState::Stale,
        EntryState::Removed,
    ];

    /// Stable lowercase name used in the database and the HTTP API.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Pending => "pending",
            EntryState::Indexed => "indexed",
            EntryState::Stale => "stale",
            EntryState::Removed => "removed",
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(EntryState::Pending),
            "indexed" => Ok(EntryState::Indexed),
            "stale" => Ok(EntryState::Stale),
            "removed" => Ok(EntryState::Removed),
            other => Err(crate::Error::Validation(format!(
                "unknown entry state: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// MediaMetadata
// ---------------------------------------------------------------------------

/// Attributes extracted from a media file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    /// Container short name (`mp3`, `mp4`, `mkv`, ...).
    pub container: String,
    /// MIME type served in `Content-Type`.
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Release year, from tags or the file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_rate: Option<u64>,
    /// Name of the extractor that produced this record.
    #[serde(default)]
    pub extractor: String,
    /// Free-form tags (artist, album, language, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// MediaEntry
// ---------------------------------------------------------------------------

/// One indexed media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaEntry {
    pub id: EntryId,
    /// Canonical filesystem location; unique key.
    pub path: PathBuf,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    /// Hex SHA-256 of the file content; empty until first hashed.
    pub content_hash: String,
    pub metadata: Option<MediaMetadata>,
    pub state: EntryState,
    /// Most recent extraction failure, if any.
    pub error: Option<String>,
    /// Consecutive failed extraction attempts.
    pub attempts: u32,
    /// Observation time of the watcher event that produced this version.
    pub observed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
}

impl MediaEntry {
    /// A freshly sighted entry in the `Pending` state.
    pub fn pending(
        path: impl Into<PathBuf>,
        size: u64,
        modified_at: DateTime<Utc>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EntryId::new(),
            path: path.into(),
            size,
            modified_at,
            content_hash: String::new(),
            metadata: None,
            state: EntryState::Pending,
            error: None,
            attempts: 0,
            observed_at,
            updated_at: Utc::now(),
            removed_at: None,
        }
    }

    /// Whether the entry can be streamed.
    pub fn is_servable(&self) -> bool {
        self.state == EntryState::Indexed
    }

    /// Whether the on-disk fingerprint still matches this entry.
    pub fn matches_fingerprint(&self, size: u64, modified_at: DateTime<Utc>) -> bool {
        self.size == size && self.modified_at == modified_at
    }

    /// MIME type for responses, falling back to the file extension.
    pub fn mime_type(&self) -> &str {
        match &self.metadata {
            Some(meta) if !meta.mime_type.is_empty() => &meta.mime_type,
            _ => mime_for_path(&self.path),
        }
    }
}

// ---------------------------------------------------------------------------
// Watch events
// ---------------------------------------------------------------------------

/// Kind of filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchEventKind {
    Created,
    Modified,
    Removed,
}

impl fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchEventKind::Created => f.write_str("created"),
            WatchEventKind::Modified => f.write_str("modified"),
            WatchEventKind::Removed => f.write_str("removed"),
        }
    }
}

/// A normalized, deduplicated filesystem change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchEventKind,
    pub observed_at: DateTime<Utc>,
}

impl WatchEvent {
    pub fn new(path: impl Into<PathBuf>, kind: WatchEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
            observed_at: Utc::now(),
        }
    }

    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self::new(path, WatchEventKind::Created)
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self::new(path, WatchEventKind::Modified)
    }

    pub fn removed(path: impl Into<PathBuf>) -> Self {
        Self::new(path, WatchEventKind::Removed)
    }
}

/// Item yielded by the watcher bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchSignal {
    /// A coalesced change.
    Event(WatchEvent),
    /// Terminal sentinel: the watch handle is gone and the library must be
    /// resynchronized by a full walk.
    Invalidated {
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Lowercased extension of `path`, if any.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Check whether `path` has one of the given media extensions.
///
/// An empty list means [`DEFAULT_MEDIA_EXTENSIONS`].
pub fn is_media_path(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = extension_of(path) else {
        return false;
    };
    if extensions.is_empty() {
        return DEFAULT_MEDIA_EXTENSIONS.contains(&ext.as_str());
    }
    extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext))
}

/// The canonical form of `path`: absolute with symlinks resolved.
///
/// A path that no longer exists (a removed file or directory) resolves its
/// deepest existing ancestor and keeps the remaining components as given.
pub fn canonical_path(path: &Path) -> PathBuf {
    if let Ok(resolved) = std::fs::canonicalize(path) {
        return resolved;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => {
            canonical_path(parent).join(name)
        }
        _ => path.to_path_buf(),
    }
}

/// Determine a content type from a container or extension name.
pub fn mime_for_container(container: &str) -> &'static str {
    match container.to_ascii_lowercase().as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "mka" => "audio/x-matroska",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "ts" | "m2ts" => "video/mp2t",
        "m4a" | "aac" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        _ => "application/octet-stream",
    }
}

/// Content type derived from the file extension of `path`.
pub fn mime_for_path(path: &Path) -> &'static str {
    extension_of(path)
        .map(|ext| mime_for_container(&ext))
        .unwrap_or("application/octet-stream")
}
