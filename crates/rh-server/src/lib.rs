//! rh-server: watcher bridge, indexing pipeline and range-streaming server.
//!
//! This crate ties the other rh-* crates into a running service:
//!
//! - [`watcher`] turns filesystem notifications into debounced watch events
//! - [`indexer`] processes those events into store entries on a sharded pool
//! - [`streaming`] serves indexed files with HTTP range support
//! - [`coordinator`] starts and stops everything in order

pub mod context;
pub mod coordinator;
pub mod error;
pub mod indexer;
pub mod purge;
pub mod resync;
pub mod router;
pub mod routes;
pub mod streaming;
pub mod watcher;

use rh_core::config::Config;
use tokio_util::sync::CancellationToken;

pub use context::AppContext;
pub use coordinator::{scan, start, Running};

/// Start the server and run until SIGINT/SIGTERM or `cancel` fires.
pub async fn run(config: Config, cancel: CancellationToken) -> rh_core::Result<()> {
    let running = start(config).await?;
    shutdown_signal(cancel).await;
    running.stop().await
}

/// Wait for a shutdown signal (SIGINT or SIGTERM) or cancellation.
pub async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => {}
    }

    tracing::info!("Shutdown signal received");
}
