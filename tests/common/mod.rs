//! Shared test harness for integration tests.
//!
//! [`TestHarness`] owns a temp directory holding a library root and the store
//! file, and runs the full coordinator on `127.0.0.1:0` with watching
//! disabled and ffprobe off, so indexing is driven explicitly through
//! [`TestHarness::submit`] and results only depend on the signature sniffer.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rh_core::config::Config;
use rh_core::events::EventBus;
use rh_core::{canonical_path, EntryState, MediaEntry, WatchEvent};
use rh_db::{Store, StoreOptions};
use rh_server::{AppContext, Running};
use tempfile::TempDir;

pub struct TestHarness {
    pub dir: TempDir,
    pub root: PathBuf,
    pub running: Running,
}

/// Configuration rooted in `dir`: one library root, store file next to it.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".into();
    config.server.port = 0;
    config.server.db_path = dir.join("data").join("index.db");
    config.library.roots = vec![dir.join("library")];
    config.watch.enabled = false;
    config.watch.debounce_ms = 50;
    config.indexer.workers = 2;
    config.indexer.retry_base_ms = 50;
    config.indexer.retry_cap_ms = 200;
    config.streaming.shutdown_grace_secs = 2;
    config.tools.use_ffprobe = false;
    config
}

impl TestHarness {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Start with a tweaked configuration.
    pub async fn start_with(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        Self::start_in(dir, tweak).await
    }

    /// Start on an existing directory (used to test restarts).
    pub async fn start_in(dir: TempDir, tweak: impl FnOnce(&mut Config)) -> Self {
        let root = dir.path().join("library");
        std::fs::create_dir_all(&root).expect("create library root");
        let root = canonical_path(&root);
        let mut config = test_config(dir.path());
        tweak(&mut config);
        let running = rh_server::start(config).await.expect("start coordinator");
        running.indexer().wait_idle().await;
        Self { dir, root, running }
    }

    /// Stop the coordinator and hand back the directory for a restart.
    pub async fn stop(self) -> TempDir {
        self.running.stop().await.expect("clean stop");
        self.dir
    }

    pub fn ctx(&self) -> &AppContext {
        self.running.context()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.ctx().store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.ctx().event_bus
    }

    pub fn addr(&self) -> SocketAddr {
        self.running.local_addr()
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr(), path)
    }

    /// Write `content` at `rel` below the library root.
    pub fn write_media(&self, rel: &str, content: &[u8]) -> PathBuf {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        std::fs::write(&path, content).expect("write media");
        path
    }

    /// Submit `event` and wait for the pipeline to finish processing it.
    pub async fn submit(&self, event: WatchEvent) {
        let indexer = self.running.indexer();
        indexer.submit(event).await.expect("submit");
        indexer.wait_idle().await;
    }

    /// Write a WAV file and index it.
    pub async fn add_wav(&self, rel: &str, data_len: u32) -> MediaEntry {
        let path = self.write_media(rel, &wav(data_len));
        self.submit(WatchEvent::created(&path)).await;
        self.entry(&path).expect("entry indexed")
    }

    pub fn entry(&self, path: &Path) -> Option<MediaEntry> {
        self.store().get(path).expect("store get")
    }

    /// Poll until the entry at `path` reaches `state`.
    pub async fn wait_for_state(&self, path: &Path, state: EntryState) -> MediaEntry {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(entry) = self.entry(path) {
                if entry.state == state {
                    return entry;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "{} did not reach {state}; last seen {:?}",
                    path.display(),
                    self.entry(path).map(|e| e.state)
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// A PCM WAV file (8 kHz mono 16-bit) with `data_len` bytes of samples.
/// Sample bytes follow `i % 251` so byte ranges are recognizable.
pub fn wav(data_len: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&8000u32.to_le_bytes());
    out.extend_from_slice(&16000u32.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend((0..data_len).map(|i| (i % 251) as u8));
    out
}

/// A context over an in-memory store, for router tests that need no server.
pub fn memory_context(roots: Vec<PathBuf>) -> AppContext {
    let mut config = Config::default();
    config.library.roots = roots;
    let store = Arc::new(Store::open_in_memory(StoreOptions::default()).expect("memory store"));
    AppContext::new(store, Arc::new(config), Arc::new(EventBus::default()))
}
