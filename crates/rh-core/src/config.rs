//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries the
//! sub-configs for the HTTP server, library roots, watcher, indexer,
//! streaming sessions, store maintenance and external tools. Every section
//! defaults sensibly so a completely empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub library: LibraryConfig,
    pub watch: WatchConfig,
    pub indexer: IndexerConfig,
    pub streaming: StreamingConfig,
    pub store: StoreConfig,
    pub tools: ToolsConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0; a random port will be assigned".into());
        }

        if self.library.roots.is_empty() {
            warnings.push("library.roots is empty; nothing will be indexed".into());
        }
        for (i, root) in self.library.roots.iter().enumerate() {
            if !root.is_absolute() {
                warnings.push(format!(
                    "library.roots[{i}] '{}' is not absolute",
                    root.display()
                ));
            }
            for (j, other) in self.library.roots.iter().enumerate() {
                if i != j && root != other && root.starts_with(other) {
                    warnings.push(format!(
                        "library.roots[{i}] is nested inside library.roots[{j}]"
                    ));
                }
            }
        }
        for ext in &self.library.extensions {
            if ext.starts_with('.') {
                warnings.push(format!(
                    "library.extensions entry '{ext}' should not include a leading dot"
                ));
            }
        }

        if self.indexer.workers == 0 {
            warnings.push("indexer.workers is 0; one worker will be used".into());
        }
        if self.indexer.retry_base_ms > self.indexer.retry_cap_ms {
            warnings.push(format!(
                "indexer.retry_base_ms ({}) exceeds retry_cap_ms ({})",
                self.indexer.retry_base_ms, self.indexer.retry_cap_ms
            ));
        }

        if self.streaming.chunk_size == 0 {
            warnings.push(format!(
                "streaming.chunk_size is 0; falling back to {DEFAULT_CHUNK_SIZE}"
            ));
        }

        if self.tools.use_ffprobe {
            if let Some(ref p) = self.tools.ffprobe_path {
                if !p.exists() {
                    warnings.push(format!(
                        "tools.ffprobe_path '{}' does not exist",
                        p.display()
                    ));
                }
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Deadline for store lookups made on behalf of a request.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            db_path: PathBuf::from("./data/reelhouse.db"),
            request_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Library roots and the media extensions indexed under them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    pub roots: Vec<PathBuf>,
    /// Lowercase extensions without a dot. Empty means the built-in list.
    pub extensions: Vec<String>,
}

impl LibraryConfig {
    /// Whether `path` is a media file according to the configured extensions.
    pub fn is_media(&self, path: &Path) -> bool {
        crate::media::is_media_path(path, &self.extensions)
    }

    /// Replace every root with its canonical path so stored entry paths and
    /// roots agree however the library was reached.
    pub fn canonicalize_roots(&mut self) {
        for root in &mut self.roots {
            *root = crate::media::canonical_path(root);
        }
    }

    /// The root containing `path`, if any.
    pub fn root_of(&self, path: &Path) -> Option<&Path> {
        self.roots
            .iter()
            .map(PathBuf::as_path)
            .find(|root| path.starts_with(root))
    }
}

/// File-system watcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub enabled: bool,
    pub debounce_ms: u64,
    /// Delay between attempts to re-establish a lost watch.
    pub rewatch_backoff_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 200,
            rewatch_backoff_secs: 5,
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn rewatch_backoff(&self) -> Duration {
        Duration::from_secs(self.rewatch_backoff_secs.max(1))
    }
}

/// Indexing pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub workers: usize,
    /// Bounded queue depth per worker shard.
    pub queue_capacity: usize,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    pub event_timeout_secs: u64,
    /// Whether shutdown processes queued events before returning.
    pub wait_for_drain: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            queue_capacity: 1024,
            retry_base_ms: 1_000,
            retry_cap_ms: 60_000,
            event_timeout_secs: 120,
            wait_for_drain: true,
        }
    }
}

impl IndexerConfig {
    /// Backoff before retry number `attempt` (1-based), doubling from the
    /// base and clamped to the cap.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .retry_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.retry_cap_ms.max(self.retry_base_ms));
        Duration::from_millis(ms)
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_secs(self.event_timeout_secs.max(1))
    }
}

/// Default streaming chunk size (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Streaming session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub chunk_size: usize,
    /// A chunk that cannot be handed to the connection within this window
    /// aborts the session.
    pub write_stall_timeout_secs: u64,
    /// How long shutdown waits for active sessions before aborting them.
    pub shutdown_grace_secs: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            write_stall_timeout_secs: 30,
            shutdown_grace_secs: 30,
        }
    }
}

impl StreamingConfig {
    pub fn effective_chunk_size(&self) -> usize {
        if self.chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            self.chunk_size
        }
    }

    pub fn write_stall_timeout(&self) -> Duration {
        Duration::from_secs(self.write_stall_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Metadata store maintenance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Attempts made on a busy database before surfacing `StoreBusy`.
    pub busy_retries: u32,
    pub busy_backoff_ms: u64,
    /// How long `Removed` rows are kept before purging.
    pub removed_retention_hours: u64,
    pub purge_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_retries: 5,
            busy_backoff_ms: 20,
            removed_retention_hours: 24 * 7,
            purge_interval_secs: 3600,
        }
    }
}

impl StoreConfig {
    pub fn removed_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.removed_retention_hours as i64)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }
}

/// External tool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffprobe_path: Option<PathBuf>,
    /// Consult ffprobe before the built-in signature sniffer.
    pub use_ffprobe: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffprobe_path: None,
            use_ffprobe: true,
        }
    }
}
