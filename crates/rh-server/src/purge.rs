//! Periodic purge of `Removed` entries past their retention window.

use std::sync::Arc;

use chrono::Utc;
use rh_core::config::StoreConfig;
use rh_core::events::{EventBus, EventPayload};
use rh_core::Result;
use rh_db::Store;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::store_call;

/// Delete entries removed longer than `retention` ago. Returns rows deleted.
pub async fn purge_once(
    store: &Arc<Store>,
    retention: chrono::Duration,
    events: &EventBus,
) -> Result<u64> {
    let before = Utc::now() - retention;
    let count = store_call(store, None, move |s| s.purge_removed(before)).await?;
    if count > 0 {
        tracing::info!(count, %before, "Purged removed entries");
        events.broadcast(EventPayload::EntriesPurged { count });
    }
    Ok(count)
}

/// Start the purge loop. Runs until `cancel` fires.
pub fn start_purge_task(
    store: Arc<Store>,
    config: StoreConfig,
    events: Arc<EventBus>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.purge_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it so startup does not purge.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = purge_once(&store, config.removed_retention(), &events).await {
                tracing::warn!(error = %e, "Purge failed");
            }
        }
        tracing::debug!("Purge task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rh_core::{EntryState, MediaEntry};
    use rh_db::StoreOptions;

    #[tokio::test]
    async fn purges_only_expired_removals() {
        let store = Arc::new(Store::open_in_memory(StoreOptions::default()).unwrap());
        let events = EventBus::default();
        let now = Utc::now();

        let old = MediaEntry::pending("/m/old.mp3", 1, now, now - chrono::Duration::days(10));
        let fresh = MediaEntry::pending("/m/fresh.mp3", 1, now, now);
        let live = MediaEntry::pending("/m/live.mp3", 1, now, now);
        for e in [&old, &fresh, &live] {
            store.upsert(e).unwrap();
        }
        store.mark_removed(&old.path, now).unwrap();
        store.mark_removed(&fresh.path, now).unwrap();

        // Nothing is older than a day yet.
        let purged = purge_once(&store, chrono::Duration::days(1), &events).await.unwrap();
        assert_eq!(purged, 0);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        // With zero retention, both removed rows go; the live one stays.
        let purged = purge_once(&store, chrono::Duration::zero(), &events).await.unwrap();
        assert_eq!(purged, 2);
        assert!(store.get(&old.path).unwrap().is_none());
        assert_eq!(store.get(&live.path).unwrap().unwrap().state, EntryState::Pending);
    }

    #[tokio::test]
    async fn task_stops_on_cancel() {
        let store = Arc::new(Store::open_in_memory(StoreOptions::default()).unwrap());
        let cancel = CancellationToken::new();
        let handle = start_purge_task(
            store,
            StoreConfig::default(),
            Arc::new(EventBus::default()),
            cancel.clone(),
        );
        cancel.cancel();
        handle.await.unwrap();
    }
}
