//! Stream session inspection.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::context::AppContext;
use crate::streaming::{SessionTotals, StreamSession};

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub active: Vec<StreamSession>,
    pub totals: SessionTotals,
}

/// GET /api/sessions
pub async fn list_sessions(State(ctx): State<AppContext>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        active: ctx.sessions.active(),
        totals: ctx.sessions.totals(),
    })
}
