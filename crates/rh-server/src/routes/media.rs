//! Media listing and streaming route handlers.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use rh_core::{EntryState, Error, MediaEntry, MediaMetadata};
use serde::{Deserialize, Serialize};

use crate::context::AppContext;
use crate::error::AppError;
use crate::streaming;

/// Query parameters for listing media.
#[derive(Debug, Default, Deserialize)]
pub struct ListMediaParams {
    /// `indexed` (default), `pending`, `stale`, `removed` or `all`.
    pub state: Option<String>,
}

impl ListMediaParams {
    fn filter(&self) -> Result<Option<EntryState>, Error> {
        match self.state.as_deref() {
            None | Some("") => Ok(Some(EntryState::Indexed)),
            Some(s) if s.eq_ignore_ascii_case("all") => Ok(None),
            Some(s) => s.parse().map(Some),
        }
    }
}

/// One entry as listed by `GET /media`.
#[derive(Debug, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub path: String,
    pub relative_path: Option<String>,
    pub size: u64,
    pub state: String,
    pub error: Option<String>,
    pub metadata: Option<MediaMetadata>,
}

impl MediaItem {
    pub(crate) fn from_entry(ctx: &AppContext, entry: &MediaEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            path: entry.path.display().to_string(),
            relative_path: ctx
                .relative_path(&entry.path)
                .map(|p| p.display().to_string()),
            size: entry.size,
            state: entry.state.as_str().to_string(),
            error: entry.error.clone(),
            metadata: entry.metadata.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MediaListResponse {
    pub taken_at: String,
    pub count: usize,
    pub items: Vec<MediaItem>,
}

/// GET /media
pub async fn list_media(
    State(ctx): State<AppContext>,
    Query(params): Query<ListMediaParams>,
) -> Result<Json<MediaListResponse>, AppError> {
    let filter = params.filter()?;
    let listing = ctx.store_call(move |s| s.list_by_state(filter)).await?;

    let items: Vec<MediaItem> = listing
        .iter()
        .map(|entry| MediaItem::from_entry(&ctx, entry))
        .collect();
    Ok(Json(MediaListResponse {
        taken_at: listing.taken_at().to_rfc3339(),
        count: items.len(),
        items,
    }))
}

/// GET /media/{*id}
pub async fn stream_media(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let entry = ctx.resolve_entry(&id).await?;
    streaming::respond(&ctx, entry, &headers, false).await
}

/// HEAD /media/{*id}
pub async fn head_media(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let entry = ctx.resolve_entry(&id).await?;
    streaming::respond(&ctx, entry, &headers, true).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(state: Option<&str>) -> ListMediaParams {
        ListMediaParams {
            state: state.map(str::to_string),
        }
    }

    #[test]
    fn state_filter_defaults_to_indexed() {
        assert_eq!(params(None).filter().unwrap(), Some(EntryState::Indexed));
        assert_eq!(params(Some("")).filter().unwrap(), Some(EntryState::Indexed));
        assert_eq!(params(Some("ALL")).filter().unwrap(), None);
        assert_eq!(params(Some("stale")).filter().unwrap(), Some(EntryState::Stale));
        assert!(params(Some("bogus")).filter().is_err());
    }
}
