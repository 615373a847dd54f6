//! Filesystem watcher bridge.
//!
//! Turns `notify` callbacks into a [`WatchStream`] of [`WatchSignal`]s:
//! raw events are normalized to `Created`/`Modified`/`Removed`, filtered to
//! media files, and coalesced per path over a trailing debounce window. A
//! `Removed` bypasses the window and replaces whatever change was pending
//! for its path. The stream ends after yielding `Invalidated` when the
//! underlying watch is lost.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rh_core::config::LibraryConfig;
use rh_core::{Error, Result, WatchEvent, WatchEventKind, WatchSignal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

use crate::resync::walk_media;

const SIGNAL_BUFFER: usize = 256;

type RawEvent = notify::Result<notify::Event>;

// ---------------------------------------------------------------------------
// Debouncer
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PendingChange {
    kind: WatchEventKind,
    observed_at: DateTime<Utc>,
    due: Instant,
    seq: u64,
}

/// Per-path trailing-edge coalescing of change events.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, PendingChange>,
    seq: u64,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
            seq: 0,
        }
    }

    /// Record `event` seen at `now`.
    ///
    /// `Created`/`Modified` are held until the window passes with no further
    /// change to the path; a pending `Created` absorbs later `Modified`s.
    /// `Removed` drops the pending change and is returned for immediate
    /// emission.
    pub fn push(&mut self, event: WatchEvent, now: Instant) -> Option<WatchEvent> {
        if event.kind == WatchEventKind::Removed {
            self.pending.remove(&event.path);
            return Some(event);
        }

        self.seq += 1;
        let due = now + self.window;
        match self.pending.get_mut(&event.path) {
            Some(p) => {
                if event.kind == WatchEventKind::Created {
                    p.kind = WatchEventKind::Created;
                }
                p.observed_at = p.observed_at.max(event.observed_at);
                p.due = due;
                p.seq = self.seq;
            }
            None => {
                self.pending.insert(
                    event.path,
                    PendingChange {
                        kind: event.kind,
                        observed_at: event.observed_at,
                        due,
                        seq: self.seq,
                    },
                );
            }
        }
        None
    }

    /// Earliest instant at which a pending change becomes due.
    pub fn next_due(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.due).min()
    }

    /// Remove and return every change due at `now`, oldest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<WatchEvent> {
        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, p)| p.due <= now)
            .map(|(path, _)| path.clone())
            .collect();
        self.take(due)
    }

    /// Remove and return every pending change.
    pub fn take_all(&mut self) -> Vec<WatchEvent> {
        let all: Vec<PathBuf> = self.pending.keys().cloned().collect();
        self.take(all)
    }

    fn take(&mut self, paths: Vec<PathBuf>) -> Vec<WatchEvent> {
        let mut out: Vec<(Instant, u64, WatchEvent)> = paths
            .into_iter()
            .filter_map(|path| {
                let p = self.pending.remove(&path)?;
                Some((
                    p.due,
                    p.seq,
                    WatchEvent {
                        path,
                        kind: p.kind,
                        observed_at: p.observed_at,
                    },
                ))
            })
            .collect();
        out.sort_by_key(|(due, seq, _)| (*due, *seq));
        out.into_iter().map(|(_, _, e)| e).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Classified {
    Changes(Vec<(PathBuf, WatchEventKind)>),
    Invalidated(String),
}

fn classify(event: notify::Event, roots: &[PathBuf]) -> Classified {
    if event.need_rescan() {
        return Classified::Invalidated("watch backend requested a rescan".into());
    }

    let kind = match event.kind {
        EventKind::Create(_) => WatchEventKind::Created,
        EventKind::Remove(_) => {
            if let Some(root) = event.paths.iter().find(|p| roots.contains(p)) {
                return Classified::Invalidated(format!(
                    "library root removed: {}",
                    root.display()
                ));
            }
            WatchEventKind::Removed
        }
        EventKind::Modify(ModifyKind::Name(mode)) => {
            return Classified::Changes(rename_changes(mode, event.paths));
        }
        EventKind::Modify(_) => WatchEventKind::Modified,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => {
            return Classified::Changes(Vec::new())
        }
    };
    Classified::Changes(event.paths.into_iter().map(|p| (p, kind)).collect())
}

fn rename_changes(mode: RenameMode, paths: Vec<PathBuf>) -> Vec<(PathBuf, WatchEventKind)> {
    match mode {
        RenameMode::From => paths
            .into_iter()
            .map(|p| (p, WatchEventKind::Removed))
            .collect(),
        RenameMode::To => paths
            .into_iter()
            .map(|p| (p, WatchEventKind::Created))
            .collect(),
        RenameMode::Both => {
            let mut it = paths.into_iter();
            let mut out = Vec::new();
            if let Some(from) = it.next() {
                out.push((from, WatchEventKind::Removed));
            }
            if let Some(to) = it.next() {
                out.push((to, WatchEventKind::Created));
            }
            out
        }
        // Backend could not tell which side this is.
        RenameMode::Any | RenameMode::Other => paths
            .into_iter()
            .map(|p| {
                let kind = if p.exists() {
                    WatchEventKind::Created
                } else {
                    WatchEventKind::Removed
                };
                (p, kind)
            })
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// WatchStream
// ---------------------------------------------------------------------------

/// Stream of watch signals for the library roots.
///
/// Dropping the stream stops the watch.
pub struct WatchStream {
    inner: ReceiverStream<WatchSignal>,
    task: JoinHandle<()>,
}

impl WatchStream {
    pub(crate) fn spawn(
        raw: mpsc::UnboundedReceiver<RawEvent>,
        library: LibraryConfig,
        debounce: Duration,
        watcher: Option<RecommendedWatcher>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let bridge = Bridge {
            debouncer: Debouncer::new(debounce),
            library,
            out: tx,
        };
        let task = tokio::spawn(bridge.run(raw, watcher));
        Self {
            inner: ReceiverStream::new(rx),
            task,
        }
    }
}

impl Stream for WatchStream {
    type Item = WatchSignal;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start watching every library root recursively.
///
/// # Errors
///
/// Fails if there are no roots, or if any root cannot be watched (missing,
/// unmounted, permission denied). Callers retry with backoff.
pub fn watch(library: &LibraryConfig, debounce: Duration) -> Result<WatchStream> {
    if library.roots.is_empty() {
        return Err(Error::Validation("no library roots to watch".into()));
    }

    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: RawEvent| {
        let _ = raw_tx.send(res);
    })
    .map_err(|e| Error::Internal(format!("failed to create file watcher: {e}")))?;

    for root in &library.roots {
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| Error::Internal(format!("failed to watch {}: {e}", root.display())))?;
        tracing::info!(path = %root.display(), "Watching library root");
    }

    Ok(WatchStream::spawn(raw_rx, library.clone(), debounce, Some(watcher)))
}

struct Bridge {
    debouncer: Debouncer,
    library: LibraryConfig,
    out: mpsc::Sender<WatchSignal>,
}

impl Bridge {
    async fn run(
        mut self,
        mut raw: mpsc::UnboundedReceiver<RawEvent>,
        _watcher: Option<RecommendedWatcher>,
    ) {
        loop {
            let next_due = self.debouncer.next_due();
            tokio::select! {
                _ = self.out.closed() => break,
                _ = sleep_until(next_due) => {
                    let due = self.debouncer.take_due(Instant::now());
                    if !self.emit_all(due).await {
                        break;
                    }
                }
                received = raw.recv() => {
                    let reason = match received {
                        Some(Ok(event)) => match classify(event, &self.library.roots) {
                            Classified::Changes(changes) => {
                                if self.apply(changes).await {
                                    continue;
                                }
                                break;
                            }
                            Classified::Invalidated(reason) => reason,
                        },
                        Some(Err(e)) => format!("watch backend error: {e}"),
                        None => "watch backend stopped".to_string(),
                    };
                    let pending = self.debouncer.take_all();
                    if self.emit_all(pending).await {
                        tracing::warn!(%reason, "Watch invalidated");
                        let _ = self.out.send(WatchSignal::Invalidated { reason }).await;
                    }
                    break;
                }
            }
        }
        tracing::debug!("Watcher bridge stopped");
    }

    /// Feed normalized changes through the filter and debouncer. Returns
    /// `false` once the consumer is gone.
    async fn apply(&mut self, changes: Vec<(PathBuf, WatchEventKind)>) -> bool {
        for (path, kind) in changes {
            let events = match kind {
                WatchEventKind::Removed => {
                    // Extension-less removals may be directories.
                    if self.library.is_media(&path) || path.extension().is_none() {
                        vec![WatchEvent::removed(path)]
                    } else {
                        Vec::new()
                    }
                }
                WatchEventKind::Created if path.is_dir() => {
                    self.expand_directory(path).await
                }
                _ if self.library.is_media(&path) && !path.is_dir() => {
                    vec![WatchEvent::new(path, kind)]
                }
                _ => Vec::new(),
            };

            let now = Instant::now();
            for event in events {
                if let Some(immediate) = self.debouncer.push(event, now) {
                    if self.out.send(WatchSignal::Event(immediate)).await.is_err() {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// A directory appeared (created or moved in): every media file in it
    /// is new.
    async fn expand_directory(&self, dir: PathBuf) -> Vec<WatchEvent> {
        let library = self.library.clone();
        let shown = dir.display().to_string();
        match tokio::task::spawn_blocking(move || walk_media(&dir, &library)).await {
            Ok(files) => {
                tracing::debug!(path = %shown, files = files.len(), "Directory appeared");
                files.into_iter().map(WatchEvent::created).collect()
            }
            Err(e) => {
                tracing::warn!(path = %shown, error = %e, "Directory walk failed");
                Vec::new()
            }
        }
    }

    async fn emit_all(&self, events: Vec<WatchEvent>) -> bool {
        for event in events {
            tracing::trace!(path = %event.path.display(), kind = %event.kind, "Watch event");
            if self.out.send(WatchSignal::Event(event)).await.is_err() {
                return false;
            }
        }
        true
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
