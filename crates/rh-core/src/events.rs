//! Index and streaming activity events.
//!
//! [`EventBus`] wraps a `tokio::sync::broadcast` channel with a bounded
//! ring-buffer of recent events so that late observers (tests, the CLI
//! `scan` command) can inspect what happened.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ids::{EntryId, SessionId};

/// Maximum number of events retained in the ring buffer.
const MAX_RECENT_EVENTS: usize = 100;

// ---------------------------------------------------------------------------
// EventPayload
// ---------------------------------------------------------------------------

/// Payload describing what happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    // -- Entry lifecycle -----------------------------------------------------
    EntryPending {
        entry_id: EntryId,
        path: String,
        reason: Option<String>,
    },
    EntryIndexed {
        entry_id: EntryId,
        path: String,
        /// Whether stored metadata was reused because the content hash matched.
        reused: bool,
    },
    EntryStale {
        entry_id: EntryId,
        path: String,
    },
    EntryRemoved {
        path: String,
        count: u64,
    },
    EntriesPurged {
        count: u64,
    },

    // -- Resync --------------------------------------------------------------
    ResyncStarted {
        reason: String,
    },
    ResyncCompleted {
        files_found: u64,
        removed: u64,
    },
    WatchInvalidated {
        reason: String,
    },

    // -- Store ---------------------------------------------------------------
    StoreRecovering {
        reason: String,
    },
    StoreRecovered,

    // -- Streaming -----------------------------------------------------------
    SessionOpened {
        session_id: SessionId,
        entry_id: EntryId,
    },
    SessionCompleted {
        session_id: SessionId,
        bytes_served: u64,
    },
    SessionAborted {
        session_id: SessionId,
        bytes_served: u64,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A timestamped event ready for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event with a fresh UUID and the current timestamp.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast channel with a bounded ring buffer of recent events.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    recent: RwLock<VecDeque<Event>>,
}

impl EventBus {
    /// Create a new event bus.
    ///
    /// `capacity` controls the broadcast channel buffer size (not the ring
    /// buffer, which is always [`MAX_RECENT_EVENTS`]).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            recent: RwLock::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Broadcast an event to all current subscribers and store it in the
    /// ring buffer.
    pub fn broadcast(&self, payload: EventPayload) {
        let event = Event::new(payload);

        {
            let mut recent = self.recent.write();
            if recent.len() >= MAX_RECENT_EVENTS {
                recent.pop_back();
            }
            recent.push_front(event.clone());
        }

        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Return the `n` most recent events (newest first).
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        let recent = self.recent.read();
        recent.iter().take(n).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let entry_id = EntryId::new();
        bus.broadcast(EventPayload::EntryIndexed {
            entry_id,
            path: "/lib/a.mp3".into(),
            reused: false,
        });

        let event = rx.try_recv().unwrap();
        match &event.payload {
            EventPayload::EntryIndexed { entry_id: got, .. } => assert_eq!(*got, entry_id),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn recent_events_capped() {
        let bus = EventBus::new(256);
        for _ in 0..150 {
            bus.broadcast(EventPayload::EntriesPurged { count: 1 });
        }
        assert_eq!(bus.recent_events(200).len(), MAX_RECENT_EVENTS);
    }

    #[test]
    fn recent_events_newest_first() {
        let bus = EventBus::new(16);
        for _ in 0..5 {
            bus.broadcast(EventPayload::EntriesPurged { count: 0 });
        }
        bus.broadcast(EventPayload::StoreRecovered);

        let recent = bus.recent_events(3);
        assert_eq!(recent.len(), 3);
        assert!(matches!(recent[0].payload, EventPayload::StoreRecovered));
    }

    #[test]
    fn no_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.broadcast(EventPayload::SessionAborted {
            session_id: SessionId::new(),
            bytes_served: 0,
            reason: "client_gone".into(),
        });
    }

    #[test]
    fn payload_tagged_serialization() {
        let event = Event::new(EventPayload::ResyncCompleted {
            files_found: 3,
            removed: 1,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["type"], "resync_completed");
        let back: Event = serde_json::from_str(&json.to_string()).unwrap();
        assert_eq!(back.id, event.id);
    }
}
