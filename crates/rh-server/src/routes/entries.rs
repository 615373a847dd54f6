//! Entry inspection route handlers.

use axum::extract::{Path, State};
use axum::Json;
use rh_core::MediaEntry;
use serde::Serialize;

use crate::context::AppContext;
use crate::error::AppError;

/// Full stored record of one entry.
#[derive(Debug, Serialize)]
pub struct EntryResponse {
    #[serde(flatten)]
    pub entry: MediaEntry,
    pub relative_path: Option<String>,
    pub servable: bool,
}

/// GET /api/entries/{*id}
pub async fn get_entry(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<EntryResponse>, AppError> {
    let entry = ctx.resolve_entry(&id).await?;
    let relative_path = ctx
        .relative_path(&entry.path)
        .map(|p| p.display().to_string());
    let servable = entry.is_servable();
    Ok(Json(EntryResponse {
        entry,
        relative_path,
        servable,
    }))
}
