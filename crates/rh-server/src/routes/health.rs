//! Health check endpoint.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::context::AppContext;
use crate::streaming::SessionTotals;

#[derive(Debug, Serialize)]
pub struct EntryCounts {
    pub pending: u64,
    pub indexed: u64,
    pub stale: u64,
    pub removed: u64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub store: &'static str,
    /// `None` while the store cannot answer.
    pub entries: Option<EntryCounts>,
    pub sessions: SessionTotals,
}

/// GET /health
///
/// Always answers `200`; the body reports whether the store is usable.
pub async fn health(State(ctx): State<AppContext>) -> Json<HealthResponse> {
    let store = ctx.store.health();
    let entries = match ctx.store_call(|s| s.counts()).await {
        Ok(c) => Some(EntryCounts {
            pending: c.pending,
            indexed: c.indexed,
            stale: c.stale,
            removed: c.removed,
        }),
        Err(e) => {
            tracing::debug!(error = %e, "Entry counts unavailable");
            None
        }
    };

    Json(HealthResponse {
        status: if entries.is_some() { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        store: store.as_str(),
        entries,
        sessions: ctx.sessions.totals(),
    })
}
