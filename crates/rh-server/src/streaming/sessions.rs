//! Stream session tracking.
//!
//! Every ranged read gets a [`StreamSession`] registered in the
//! [`SessionRegistry`] for the lifetime of its connection. The session is
//! driven through `Opened -> Streaming -> {Completed | Aborted}` by a shared
//! [`SessionHandle`]; reaching a terminal state removes it from the registry
//! and bumps the matching total. The registry also counts open file handles
//! so shutdown can wait until every read has released its file.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rh_core::events::{EventBus, EventPayload};
use rh_core::{EntryId, SessionId};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::range::ByteRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Opened,
    Streaming,
    Completed,
    Aborted,
}

/// Why a session ended before its last byte was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// The client went away (the response body was dropped).
    ClientGone,
    /// A chunk could not be handed to the connection within the stall timeout.
    WriteStalled,
    /// Reading the file failed (including the file shrinking under us).
    ReadFailed,
    /// The server is shutting down.
    Shutdown,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::ClientGone => "client_gone",
            AbortReason::WriteStalled => "write_stalled",
            AbortReason::ReadFailed => "read_failed",
            AbortReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one connection's read.
#[derive(Debug, Clone, Serialize)]
pub struct StreamSession {
    pub id: SessionId,
    pub entry_id: EntryId,
    pub entry_path: PathBuf,
    pub range_start: u64,
    pub range_end: u64,
    pub bytes_served: u64,
    pub started_at: DateTime<Utc>,
    pub state: SessionState,
}

/// Registry-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionTotals {
    pub active: usize,
    pub completed: u64,
    pub aborted: u64,
    pub open_handles: usize,
}

struct Inner {
    sessions: DashMap<SessionId, StreamSession>,
    completed: AtomicU64,
    aborted: AtomicU64,
    open_handles: AtomicUsize,
    idle: Notify,
    shutdown: CancellationToken,
    events: Arc<EventBus>,
}

/// Thread-safe registry of active stream sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: DashMap::new(),
                completed: AtomicU64::new(0),
                aborted: AtomicU64::new(0),
                open_handles: AtomicUsize::new(0),
                idle: Notify::new(),
                shutdown: CancellationToken::new(),
                events,
            }),
        }
    }

    /// Register a new session for `range` of the entry at `entry_path`.
    pub fn open(&self, entry_id: EntryId, entry_path: PathBuf, range: ByteRange) -> Arc<SessionHandle> {
        let id = SessionId::new();
        let session = StreamSession {
            id,
            entry_id,
            entry_path,
            range_start: range.start,
            range_end: range.end,
            bytes_served: 0,
            started_at: Utc::now(),
            state: SessionState::Opened,
        };
        tracing::debug!(
            session_id = %id,
            entry_id = %entry_id,
            path = %session.entry_path.display(),
            range = %range,
            "Stream session opened"
        );
        self.inner.sessions.insert(id, session);
        self.inner
            .events
            .broadcast(EventPayload::SessionOpened { session_id: id, entry_id });

        Arc::new(SessionHandle {
            id,
            registry: self.clone(),
            cancel: self.inner.shutdown.child_token(),
            bytes_served: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        })
    }

    /// Count an open file handle until the returned guard is dropped.
    pub fn track_handle(&self) -> HandleGuard {
        self.inner.open_handles.fetch_add(1, Ordering::AcqRel);
        HandleGuard {
            registry: self.clone(),
        }
    }

    pub fn get(&self, id: SessionId) -> Option<StreamSession> {
        self.inner.sessions.get(&id).map(|s| s.value().clone())
    }

    /// All sessions that have not reached a terminal state.
    pub fn active(&self) -> Vec<StreamSession> {
        let mut sessions: Vec<_> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    pub fn active_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn open_handles(&self) -> usize {
        self.inner.open_handles.load(Ordering::Acquire)
    }

    pub fn totals(&self) -> SessionTotals {
        SessionTotals {
            active: self.active_count(),
            completed: self.inner.completed.load(Ordering::Relaxed),
            aborted: self.inner.aborted.load(Ordering::Relaxed),
            open_handles: self.open_handles(),
        }
    }

    fn is_idle(&self) -> bool {
        self.inner.sessions.is_empty() && self.open_handles() == 0
    }

    /// Wait until no session is active and no file handle is open.
    ///
    /// Returns `false` if that did not happen within `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_idle() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_idle();
            }
        }
    }

    /// Tell every producer to stop. Their sessions end as
    /// [`AbortReason::Shutdown`].
    pub fn abort_all(&self) {
        tracing::info!(active = self.active_count(), "Aborting all stream sessions");
        self.inner.shutdown.cancel();
    }

    fn finish(&self, id: SessionId, bytes_served: u64, outcome: Result<(), AbortReason>) {
        let removed = self.inner.sessions.remove(&id);
        let entry_id = removed.as_ref().map(|(_, s)| s.entry_id);
        match outcome {
            Ok(()) => {
                self.inner.completed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(session_id = %id, bytes_served, "Stream session completed");
                self.inner.events.broadcast(EventPayload::SessionCompleted {
                    session_id: id,
                    bytes_served,
                });
            }
            Err(reason) => {
                self.inner.aborted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    session_id = %id,
                    entry_id = ?entry_id,
                    bytes_served,
                    %reason,
                    "Stream session aborted"
                );
                self.inner.events.broadcast(EventPayload::SessionAborted {
                    session_id: id,
                    bytes_served,
                    reason: reason.to_string(),
                });
            }
        }
        self.inner.idle.notify_waiters();
    }
}

/// Shared control of one session, held by its producer and its body.
///
/// The first terminal transition wins; later ones are ignored.
pub struct SessionHandle {
    id: SessionId,
    registry: SessionRegistry,
    cancel: CancellationToken,
    bytes_served: AtomicU64,
    finished: AtomicBool,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Cancelled when the registry aborts all sessions.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn bytes_served(&self) -> u64 {
        self.bytes_served.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn mark_streaming(&self) {
        if let Some(mut s) = self.registry.inner.sessions.get_mut(&self.id) {
            if s.state == SessionState::Opened {
                s.state = SessionState::Streaming;
            }
        }
    }

    /// Record `n` more bytes taken by the connection.
    pub fn add_bytes(&self, n: u64) {
        let total = self.bytes_served.fetch_add(n, Ordering::AcqRel) + n;
        if let Some(mut s) = self.registry.inner.sessions.get_mut(&self.id) {
            s.bytes_served = total;
        }
    }

    pub fn complete(&self) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.registry.finish(self.id, self.bytes_served(), Ok(()));
        }
    }

    pub fn abort(&self, reason: AbortReason) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.registry.finish(self.id, self.bytes_served(), Err(reason));
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.abort(AbortReason::ClientGone);
    }
}

/// Decrements the registry's open-handle count on drop.
pub struct HandleGuard {
    registry: SessionRegistry,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.registry.inner.open_handles.fetch_sub(1, Ordering::AcqRel);
        self.registry.inner.idle.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(EventBus::default()))
    }

    fn range() -> ByteRange {
        ByteRange { start: 0, end: 99 }
    }

    #[test]
    fn session_lifecycle_completed() {
        let reg = registry();
        let handle = reg.open(EntryId::new(), "/lib/a.mp3".into(), range());
        assert_eq!(reg.get(handle.id()).unwrap().state, SessionState::Opened);

        handle.mark_streaming();
        handle.add_bytes(60);
        handle.add_bytes(40);
        let snapshot = reg.get(handle.id()).unwrap();
        assert_eq!(snapshot.state, SessionState::Streaming);
        assert_eq!(snapshot.bytes_served, 100);

        handle.complete();
        assert!(reg.get(handle.id()).is_none());
        let totals = reg.totals();
        assert_eq!(totals.active, 0);
        assert_eq!(totals.completed, 1);
        assert_eq!(totals.aborted, 0);
    }

    #[test]
    fn first_terminal_state_wins() {
        let reg = registry();
        let handle = reg.open(EntryId::new(), "/lib/a.mp3".into(), range());
        handle.complete();
        handle.abort(AbortReason::ReadFailed);
        drop(handle);
        let totals = reg.totals();
        assert_eq!(totals.completed, 1);
        assert_eq!(totals.aborted, 0);
    }

    #[test]
    fn dropped_handle_aborts_as_client_gone() {
        let events = Arc::new(EventBus::default());
        let reg = SessionRegistry::new(events.clone());
        let handle = reg.open(EntryId::new(), "/lib/a.mp3".into(), range());
        drop(handle);
        assert_eq!(reg.totals().aborted, 1);
        let recent = events.recent_events(1);
        assert!(matches!(
            &recent[0].payload,
            EventPayload::SessionAborted { reason, .. } if reason == "client_gone"
        ));
    }

    #[test]
    fn handle_guards_are_counted() {
        let reg = registry();
        let a = reg.track_handle();
        let b = reg.track_handle();
        assert_eq!(reg.open_handles(), 2);
        drop(a);
        assert_eq!(reg.open_handles(), 1);
        drop(b);
        assert_eq!(reg.open_handles(), 0);
    }

    #[tokio::test]
    async fn wait_idle_returns_once_sessions_end() {
        let reg = registry();
        let handle = reg.open(EntryId::new(), "/lib/a.mp3".into(), range());
        let guard = reg.track_handle();

        let waiter = {
            let reg = reg.clone();
            tokio::spawn(async move { reg.wait_idle(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.complete();
        drop(guard);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_times_out_under_grace() {
        let reg = registry();
        let _handle = reg.open(EntryId::new(), "/lib/a.mp3".into(), range());
        assert!(!reg.wait_idle(Duration::from_secs(30)).await);
    }

    #[test]
    fn abort_all_cancels_session_tokens() {
        let reg = registry();
        let handle = reg.open(EntryId::new(), "/lib/a.mp3".into(), range());
        assert!(!handle.cancel_token().is_cancelled());
        reg.abort_all();
        assert!(handle.cancel_token().is_cancelled());
    }
}
