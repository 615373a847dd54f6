//! Indexing pipeline.
//!
//! Watch events are sharded by path hash over a fixed pool of workers, so all
//! events for one path are processed in arrival order by one worker while
//! distinct paths proceed concurrently. Each event runs under a deadline.
//!
//! Failed extractions leave the entry `Pending` with its error recorded and
//! schedule a retry with exponential backoff; a newer event for the same path
//! cancels the scheduled retry. Nothing that goes wrong while processing an
//! event escapes the pipeline.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rh_core::config::IndexerConfig;
use rh_core::events::{EventBus, EventPayload};
use rh_core::{
    canonical_path, EntryState, Error, ErrorClass, MediaEntry, Result, WatchEvent, WatchEventKind,
};
use rh_db::{Store, UpsertOutcome};
use rh_probe::fingerprint::{self, hash_file_async};
use rh_probe::{ExtractionOutcome, Extractor};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::store_call;

#[derive(Debug)]
struct Job {
    event: WatchEvent,
    /// Retries already made for this event.
    attempt: u32,
}

/// What processing one event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    /// The stored entry already matched the file.
    Unchanged,
    Indexed { reused: bool },
    Removed(u64),
    /// Extraction did not succeed; the entry is `Pending` and a retry is due.
    Failed(String),
    /// A newer observation of the path was already stored.
    Superseded,
}

struct Shared {
    store: Arc<Store>,
    extractor: Arc<dyn Extractor>,
    events: Arc<EventBus>,
    config: IndexerConfig,
    shards: Vec<mpsc::Sender<Job>>,
    retries: DashMap<PathBuf, (u64, CancellationToken)>,
    retry_generation: AtomicU64,
    retry_root: CancellationToken,
    intake: CancellationToken,
    discard_queued: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Handle to the running worker pool.
pub struct Indexer {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Indexer {
    /// Spawn `config.workers` workers.
    pub fn start(
        store: Arc<Store>,
        extractor: Arc<dyn Extractor>,
        events: Arc<EventBus>,
        config: IndexerConfig,
    ) -> Self {
        let workers = config.workers.max(1);
        let depth = (config.queue_capacity / workers).max(1);

        let (shards, receivers): (Vec<_>, Vec<_>) =
            (0..workers).map(|_| mpsc::channel::<Job>(depth)).unzip();

        let shared = Arc::new(Shared {
            store,
            extractor,
            events,
            config,
            shards,
            retries: DashMap::new(),
            retry_generation: AtomicU64::new(0),
            retry_root: CancellationToken::new(),
            intake: CancellationToken::new(),
            discard_queued: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        let handles = receivers
            .into_iter()
            .enumerate()
            .map(|(shard, rx)| tokio::spawn(worker_loop(shard, shared.clone(), rx)))
            .collect();

        tracing::info!(workers, queue_depth = depth, "Indexer started");
        Self {
            shared,
            workers: Mutex::new(handles),
        }
    }

    /// Queue `event` on the worker that owns its path. Waits while that
    /// worker's queue is full. Cancels any retry scheduled for the path.
    ///
    /// The event path is canonicalized first, so a file reached through a
    /// symlink and through its target maps to one entry.
    pub async fn submit(&self, mut event: WatchEvent) -> Result<()> {
        event.path = canonical_path(&event.path);
        self.shared.enqueue(Job { event, attempt: 0 }, true).await
    }

    /// Wait until every submitted event has been processed. Scheduled retries
    /// are not waited for.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn scheduled_retries(&self) -> usize {
        self.shared.retries.len()
    }

    /// Stop intake, cancel scheduled retries and stop the workers.
    ///
    /// With `wait_for_drain` the workers first process everything already
    /// queued; otherwise queued events are dropped. The event each worker is
    /// currently processing always finishes.
    pub async fn shutdown(&self, wait_for_drain: bool) {
        self.shared
            .discard_queued
            .store(!wait_for_drain, Ordering::Release);
        self.shared.retry_root.cancel();
        self.shared.retries.clear();
        self.shared.intake.cancel();

        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Indexer worker ended abnormally");
            }
        }
        tracing::info!(drained = wait_for_drain, "Indexer stopped");
    }
}

async fn worker_loop(shard: usize, shared: Arc<Shared>, mut rx: mpsc::Receiver<Job>) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shared.intake.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        shared.run_job(job).await;
        shared.finish_one();
    }

    rx.close();
    let discard = shared.discard_queued.load(Ordering::Acquire);
    let mut dropped = 0usize;
    while let Ok(job) = rx.try_recv() {
        if discard {
            dropped += 1;
        } else {
            shared.run_job(job).await;
        }
        shared.finish_one();
    }
    if dropped > 0 {
        tracing::info!(shard, dropped, "Discarded queued events on shutdown");
    }
}

impl Shared {
    fn shard_for(&self, path: &Path) -> usize {
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    async fn enqueue(&self, job: Job, fresh: bool) -> Result<()> {
        if self.intake.is_cancelled() {
            return Err(Error::Internal("indexer is shut down".into()));
        }
        if fresh {
            if let Some((_, (_, token))) = self.retries.remove(&job.event.path) {
                tracing::debug!(path = %job.event.path.display(), "Newer event cancels scheduled retry");
                token.cancel();
            }
        }

        let shard = self.shard_for(&job.event.path);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if self.shards[shard].send(job).await.is_err() {
            self.finish_one();
            return Err(Error::Internal("indexer worker stopped".into()));
        }
        Ok(())
    }

    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn run_job(self: &Arc<Self>, job: Job) {
        let path = job.event.path.clone();
        let kind = job.event.kind;
        let deadline = self.config.event_timeout();

        match tokio::time::timeout(deadline, self.process(&job.event)).await {
            Ok(Ok(Processed::Failed(reason))) => {
                tracing::info!(
                    path = %path.display(),
                    attempt = job.attempt + 1,
                    %reason,
                    "Extraction did not succeed"
                );
                self.schedule_retry(job);
            }
            Ok(Ok(outcome)) => {
                tracing::debug!(path = %path.display(), %kind, ?outcome, "Event processed");
            }
            Ok(Err(Error::StoreRecovering)) => {
                tracing::debug!(path = %path.display(), "Store recovering; event left to resync");
            }
            Ok(Err(e)) => match e.class() {
                ErrorClass::StoreCorruption => {
                    tracing::error!(path = %path.display(), error = %e, "Store corrupt while indexing");
                }
                ErrorClass::Transient => {
                    tracing::warn!(path = %path.display(), error = %e, "Transient indexing failure");
                    self.schedule_retry(job);
                }
                _ => {
                    tracing::warn!(path = %path.display(), error = %e, "Indexing failed");
                }
            },
            Err(_) => {
                tracing::warn!(
                    path = %path.display(),
                    timeout_secs = deadline.as_secs(),
                    "Event processing timed out"
                );
                self.schedule_retry(job);
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, job: Job) {
        if self.intake.is_cancelled() {
            return;
        }
        let attempt = job.attempt + 1;
        let delay = self.config.retry_delay(attempt);
        let generation = self.retry_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let token = self.retry_root.child_token();
        let path = job.event.path.clone();

        if let Some((_, previous)) = self
            .retries
            .insert(path.clone(), (generation, token.clone()))
        {
            previous.cancel();
        }
        tracing::debug!(
            path = %path.display(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            shared.retries.remove_if(&path, |_, (g, _)| *g == generation);
            let retry = Job {
                event: job.event,
                attempt,
            };
            if let Err(e) = shared.enqueue(retry, false).await {
                tracing::debug!(path = %path.display(), error = %e, "Retry dropped");
            }
        });
    }

    async fn store<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        store_call(&self.store, None, f).await
    }

    async fn upsert(&self, entry: &MediaEntry) -> Result<UpsertOutcome> {
        let entry = entry.clone();
        self.store(move |s| s.upsert(&entry)).await
    }

    async fn process(&self, event: &WatchEvent) -> Result<Processed> {
        match event.kind {
            WatchEventKind::Removed => self.remove(&event.path, event.observed_at).await,
            WatchEventKind::Created | WatchEventKind::Modified => self.index(event).await,
        }
    }

    async fn remove(&self, path: &Path, observed_at: DateTime<Utc>) -> Result<Processed> {
        let target = path.to_path_buf();
        let count = self
            .store(move |s| {
                if s.mark_removed(&target, observed_at)? {
                    Ok(1)
                } else {
                    s.mark_removed_under(&target, observed_at)
                }
            })
            .await?;

        if count > 0 {
            tracing::info!(path = %path.display(), count, "Entry removed");
            self.events.broadcast(EventPayload::EntryRemoved {
                path: path.display().to_string(),
                count,
            });
        }
        Ok(Processed::Removed(count))
    }

    async fn index(&self, event: &WatchEvent) -> Result<Processed> {
        let path = event.path.clone();
        let probe_path = path.clone();
        let (found, existing) = self
            .store(move |s| Ok((fingerprint::stat(&probe_path)?, s.get(&probe_path)?)))
            .await?;

        let Some(fp) = found else {
            tracing::debug!(path = %path.display(), "File vanished before indexing");
            return self.remove(&path, event.observed_at).await;
        };

        if let Some(e) = &existing {
            if e.state == EntryState::Indexed && e.matches_fingerprint(fp.size, fp.modified_at) {
                return Ok(Processed::Unchanged);
            }
        }

        let (mut entry, announce) = match existing {
            Some(mut e) if e.state != EntryState::Removed => {
                let became_stale = e.state == EntryState::Indexed;
                if became_stale {
                    e.state = EntryState::Stale;
                }
                e.size = fp.size;
                e.modified_at = fp.modified_at;
                e.observed_at = event.observed_at;
                (e, became_stale.then_some(EntryState::Stale))
            }
            previous => {
                let mut e = MediaEntry::pending(&path, fp.size, fp.modified_at, event.observed_at);
                if let Some(removed) = previous {
                    e.id = removed.id;
                }
                (e, Some(EntryState::Pending))
            }
        };

        if self.upsert(&entry).await? == UpsertOutcome::Superseded {
            return Ok(Processed::Superseded);
        }
        match announce {
            Some(EntryState::Stale) => {
                tracing::debug!(entry_id = %entry.id, path = %path.display(), state = "stale", "Entry changed");
                self.events.broadcast(EventPayload::EntryStale {
                    entry_id: entry.id,
                    path: path.display().to_string(),
                });
            }
            Some(_) => {
                tracing::debug!(entry_id = %entry.id, path = %path.display(), state = "pending", "New entry");
                self.events.broadcast(EventPayload::EntryPending {
                    entry_id: entry.id,
                    path: path.display().to_string(),
                    reason: None,
                });
            }
            None => {}
        }

        let hash = match hash_file_async(path.clone()).await {
            Ok(hash) => hash,
            Err(Error::Io { source }) if source.kind() == std::io::ErrorKind::NotFound => {
                return self.remove(&path, event.observed_at).await;
            }
            Err(e) => return self.fail(entry, format!("hashing failed: {e}")).await,
        };

        // Same bytes as when the stored metadata was extracted.
        if entry.metadata.is_some() && !entry.content_hash.is_empty() && entry.content_hash == hash {
            return self.mark_indexed(entry, true).await;
        }

        match self.extractor.extract(&path).await {
            ExtractionOutcome::Extracted(meta) => {
                entry.metadata = Some(meta);
                entry.content_hash = hash;
                self.mark_indexed(entry, false).await
            }
            other => {
                let reason = format!("{}: {}", other.kind(), other.reason().unwrap_or_default());
                self.fail(entry, reason).await
            }
        }
    }

    async fn mark_indexed(&self, mut entry: MediaEntry, reused: bool) -> Result<Processed> {
        entry.state = EntryState::Indexed;
        entry.error = None;
        entry.attempts = 0;
        entry.removed_at = None;
        if self.upsert(&entry).await? == UpsertOutcome::Superseded {
            return Ok(Processed::Superseded);
        }
        tracing::info!(
            entry_id = %entry.id,
            path = %entry.path.display(),
            state = "indexed",
            reused,
            "Entry indexed"
        );
        self.events.broadcast(EventPayload::EntryIndexed {
            entry_id: entry.id,
            path: entry.path.display().to_string(),
            reused,
        });
        Ok(Processed::Indexed { reused })
    }

    /// Record a failed extraction. The stored hash and metadata are left as
    /// they were so they keep describing the same content.
    async fn fail(&self, mut entry: MediaEntry, reason: String) -> Result<Processed> {
        entry.state = EntryState::Pending;
        entry.error = Some(reason.clone());
        entry.attempts = entry.attempts.saturating_add(1);
        if self.upsert(&entry).await? == UpsertOutcome::Superseded {
            return Ok(Processed::Superseded);
        }
        self.events.broadcast(EventPayload::EntryPending {
            entry_id: entry.id,
            path: entry.path.display().to_string(),
            reason: Some(reason.clone()),
        });
        Ok(Processed::Failed(reason))
    }
}
