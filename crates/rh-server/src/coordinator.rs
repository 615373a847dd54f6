//! Component wiring and lifecycle.
//!
//! [`start`] opens the store, establishes the watch, starts the indexing
//! pipeline, seeds the index with a full resync and binds the HTTP server.
//! [`Running::stop`] tears everything down in the reverse order, giving
//! active stream sessions a grace period before aborting them.
//!
//! Two background tasks keep the index honest while running: the watch loop
//! feeds coalesced events to the pipeline and re-establishes the watch (with a
//! resync) whenever it is invalidated, and the store monitor resets the store
//! and resyncs when corruption is detected.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rh_core::config::Config;
use rh_core::events::{EventBus, EventPayload};
use rh_core::{Error, Result, WatchSignal};
use rh_db::{StateCounts, Store, StoreHealth, StoreOptions};
use rh_probe::{CompositeExtractor, Extractor};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::{store_call, AppContext};
use crate::indexer::Indexer;
use crate::purge::start_purge_task;
use crate::resync::resync;
use crate::router::build_router;
use crate::watcher::{self, WatchStream};

/// How long `stop` waits for sessions that were told to abort.
const ABORT_SETTLE: Duration = Duration::from_secs(5);

/// A started server and its background tasks.
pub struct Running {
    ctx: AppContext,
    indexer: Arc<Indexer>,
    local_addr: SocketAddr,
    http_cancel: CancellationToken,
    background_cancel: CancellationToken,
    server: JoinHandle<std::io::Result<()>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Open the store off the async runtime.
async fn open_store(config: &Config) -> Result<Arc<Store>> {
    let path = config.server.db_path.clone();
    let options = StoreOptions::from(&config.store);
    let (store, report) = tokio::task::spawn_blocking(move || Store::open(&path, options))
        .await
        .map_err(|e| Error::Internal(format!("store open task failed: {e}")))??;

    if report.unclean_shutdown {
        tracing::warn!("Previous shutdown was not clean");
    }
    if report.reindex_required {
        tracing::info!("Stored index discarded; a full resync will rebuild it");
    }
    Ok(Arc::new(store))
}

fn build_extractor(config: &Config) -> Arc<dyn Extractor> {
    let extractor = CompositeExtractor::from_config(&config.tools);
    tracing::info!(extractors = ?extractor.names(), "Extractor chain ready");
    Arc::new(extractor)
}

/// Start every component and begin serving.
///
/// # Errors
///
/// Fails fast if the store cannot be opened or the listen address cannot be
/// bound. An unavailable library root is not an error: it is skipped by the
/// resync and the watch is retried with backoff.
pub async fn start(mut config: Config) -> Result<Running> {
    for warning in config.validate() {
        tracing::warn!("Config warning: {warning}");
    }
    config.library.canonicalize_roots();
    let config = Arc::new(config);

    let store = open_store(&config).await?;
    let extractor = build_extractor(&config);
    let event_bus = Arc::new(EventBus::default());
    let ctx = AppContext::new(store.clone(), config.clone(), event_bus.clone());

    let initial_watch = if config.watch.enabled {
        match watcher::watch(&config.library, config.watch.debounce()) {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::warn!(error = %e, "Could not establish watch, will retry");
                None
            }
        }
    } else {
        tracing::info!("File watching disabled");
        None
    };

    let indexer = Arc::new(Indexer::start(
        store.clone(),
        extractor,
        event_bus.clone(),
        config.indexer.clone(),
    ));

    let background_cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    if config.watch.enabled {
        tasks.push(tokio::spawn(run_watch_loop(
            initial_watch,
            store.clone(),
            indexer.clone(),
            config.clone(),
            event_bus.clone(),
            background_cancel.clone(),
        )));
    }

    if let Err(e) = resync(&store, &indexer, &config.library, &event_bus, "startup").await {
        tracing::warn!(error = %e, "Initial resync failed");
    }

    tasks.push(tokio::spawn(run_store_monitor(
        store.clone(),
        indexer.clone(),
        config.clone(),
        event_bus.clone(),
        background_cancel.clone(),
    )));
    tasks.push(start_purge_task(
        store.clone(),
        config.store.clone(),
        event_bus.clone(),
        background_cancel.clone(),
    ));

    let bind = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind to {bind}: {e}")))?;
    let local_addr = listener.local_addr()?;

    let http_cancel = CancellationToken::new();
    let app = build_router(ctx.clone());
    let shutdown = http_cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });
    tracing::info!(addr = %local_addr, "Serving HTTP");

    Ok(Running {
        ctx,
        indexer,
        local_addr,
        http_cancel,
        background_cancel,
        server,
        tasks,
    })
}

impl Running {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    pub fn indexer(&self) -> &Arc<Indexer> {
        &self.indexer
    }

    /// Stop serving and shut every component down.
    ///
    /// Active sessions get `streaming.shutdown_grace` to finish before they
    /// are aborted. The store is closed last, recording a clean shutdown.
    pub async fn stop(self) -> Result<()> {
        tracing::info!("Shutting down");
        let config = self.ctx.config.clone();
        let grace = config.streaming.shutdown_grace();

        self.http_cancel.cancel();
        if !self.ctx.sessions.wait_idle(grace).await {
            tracing::warn!(
                active = self.ctx.sessions.active_count(),
                "Grace period elapsed with sessions still active"
            );
            self.ctx.sessions.abort_all();
            if !self.ctx.sessions.wait_idle(ABORT_SETTLE).await {
                tracing::warn!(
                    open_handles = self.ctx.sessions.open_handles(),
                    "Sessions did not settle after abort"
                );
            }
        }

        let mut server = self.server;
        match tokio::time::timeout(ABORT_SETTLE, &mut server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "HTTP server ended with error"),
            Ok(Err(e)) => tracing::warn!(error = %e, "HTTP server task failed"),
            Err(_) => {
                tracing::warn!("HTTP server did not stop in time, aborting");
                server.abort();
            }
        }

        self.indexer.shutdown(config.indexer.wait_for_drain).await;

        self.background_cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }

        store_call(&self.ctx.store, None, |s| s.close()).await?;
        tracing::info!("Shutdown complete");
        Ok(())
    }
}

/// Walk and index every root once, without serving or watching.
///
/// Returns the entry counts afterwards. Extraction retries still scheduled
/// when the walk has been processed are abandoned; those entries stay
/// `Pending`.
pub async fn scan(mut config: Config) -> Result<StateCounts> {
    config.library.canonicalize_roots();
    let store = open_store(&config).await?;
    let event_bus = Arc::new(EventBus::default());
    let indexer = Indexer::start(
        store.clone(),
        build_extractor(&config),
        event_bus.clone(),
        config.indexer.clone(),
    );

    let report = resync(&store, &indexer, &config.library, &event_bus, "scan").await?;
    indexer.wait_idle().await;
    indexer.shutdown(true).await;
    tracing::info!(files_found = report.files_found, removed = report.removed, "Scan finished");

    let counts = store_call(&store, None, |s| s.counts()).await?;
    store_call(&store, None, |s| s.close()).await?;
    Ok(counts)
}

async fn run_watch_loop(
    mut initial: Option<WatchStream>,
    store: Arc<Store>,
    indexer: Arc<Indexer>,
    config: Arc<Config>,
    events: Arc<EventBus>,
    cancel: CancellationToken,
) {
    let backoff = config.watch.rewatch_backoff();
    let mut resync_reason: Option<String> = None;

    loop {
        let established = match initial.take() {
            Some(stream) => Ok(stream),
            None => watcher::watch(&config.library, config.watch.debounce()),
        };
        let mut stream = match established {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    retry_in_secs = backoff.as_secs(),
                    "Could not establish watch"
                );
                resync_reason.get_or_insert_with(|| "rewatch".to_string());
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => continue,
                }
            }
        };

        // Changes made while unwatched are only found by walking.
        if let Some(reason) = resync_reason.take() {
            if let Err(e) = resync(&store, &indexer, &config.library, &events, &reason).await {
                tracing::warn!(error = %e, "Resync after rewatch failed");
            }
        }

        loop {
            let signal = tokio::select! {
                _ = cancel.cancelled() => return,
                signal = stream.next() => signal,
            };
            match signal {
                Some(WatchSignal::Event(event)) => {
                    if let Err(e) = indexer.submit(event).await {
                        tracing::debug!(error = %e, "Dropped watch event");
                    }
                }
                Some(WatchSignal::Invalidated { reason }) => {
                    tracing::warn!(%reason, "Watch invalidated");
                    events.broadcast(EventPayload::WatchInvalidated {
                        reason: reason.clone(),
                    });
                    resync_reason = Some(reason);
                    break;
                }
                None => {
                    tracing::warn!("Watch stream ended");
                    resync_reason = Some("watch stream ended".to_string());
                    break;
                }
            }
        }
    }
}

async fn run_store_monitor(
    store: Arc<Store>,
    indexer: Arc<Indexer>,
    config: Arc<Config>,
    events: Arc<EventBus>,
    cancel: CancellationToken,
) {
    let mut health = store.subscribe_health();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = health.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
        let state = *health.borrow_and_update();
        if state != StoreHealth::Corrupt {
            continue;
        }

        tracing::error!("Store corrupt, resetting and rebuilding the index");
        events.broadcast(EventPayload::StoreRecovering {
            reason: "corruption detected".to_string(),
        });
        if let Err(e) = store_call(&store, None, |s| s.reset()).await {
            tracing::error!(error = %e, "Store reset failed; index stays unavailable");
            return;
        }
        events.broadcast(EventPayload::StoreRecovered);

        if let Err(e) = resync(&store, &indexer, &config.library, &events, "store reset").await {
            tracing::warn!(error = %e, "Resync after store reset failed");
        }
    }
}
