//! Range-aware media delivery.
//!
//! [`respond`] turns a resolved entry and the request's `Range` header into a
//! `200`/`206` response whose body is fed by a per-session producer task.

pub mod body;
pub mod range;
pub mod sessions;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use chrono::{DateTime, Utc};
use rh_core::{Error, MediaEntry};

use crate::context::AppContext;
use crate::error::AppError;
use body::{OpenFile, ProducerOptions};
use range::{parse_range, ByteRange, RangeError};

pub use sessions::{AbortReason, SessionRegistry, SessionState, SessionTotals, StreamSession};

/// Build the response for a `GET` (or `HEAD` when `head_only`) of `entry`.
///
/// The entry must be `Indexed`. The size is taken from the file as opened, so
/// a file rewritten after indexing is served as it now is.
pub async fn respond(
    ctx: &AppContext,
    entry: MediaEntry,
    headers: &HeaderMap,
    head_only: bool,
) -> Result<Response, AppError> {
    if !entry.is_servable() {
        return Err(Error::NotReady(format!("entry is {}", entry.state)).into());
    }

    let (file, size) = if head_only {
        (None, file_size(&entry).await?)
    } else {
        let file = open_file(ctx, &entry).await?;
        let size = file_len(&file).await?;
        (Some(file), size)
    };

    let requested = headers
        .get(header::RANGE)
        .map(|v| {
            v.to_str()
                .map_err(|_| Error::Protocol("Range header is not ASCII".into()))
        })
        .transpose()?;

    let (status, span) = match requested.map(|h| parse_range(h, size)) {
        None | Some(Ok(None)) => (StatusCode::OK, ByteRange::full(size)),
        Some(Ok(Some(range))) => (StatusCode::PARTIAL_CONTENT, Some(range)),
        Some(Err(RangeError::Malformed(msg))) => return Err(Error::Protocol(msg).into()),
        Some(Err(RangeError::Unsatisfiable)) => {
            return Err(Error::RangeNotSatisfiable { size }.into())
        }
    };

    let content_length = span.map(|r| r.len()).unwrap_or(0);
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, entry.mime_type())
        .header(header::CONTENT_LENGTH, content_length)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::LAST_MODIFIED, http_date(&entry.modified_at));
    if !entry.content_hash.is_empty() {
        builder = builder.header(header::ETAG, format!("\"{}\"", entry.content_hash));
    }
    if let (StatusCode::PARTIAL_CONTENT, Some(range)) = (status, span) {
        builder = builder.header(header::CONTENT_RANGE, range.content_range(size));
    }

    let body = match (file, span) {
        (Some(file), Some(range)) => {
            let session = ctx.sessions.open(entry.id, entry.path.clone(), range);
            let options = ProducerOptions {
                chunk_size: ctx.config.streaming.effective_chunk_size(),
                stall_timeout: ctx.config.streaming.write_stall_timeout(),
            };
            body::stream_body(file, range, session, options)
        }
        _ => Body::empty(),
    };

    builder
        .body(body)
        .map_err(|e| Error::Internal(format!("failed to build response: {e}")).into())
}

async fn open_file(ctx: &AppContext, entry: &MediaEntry) -> Result<OpenFile, AppError> {
    match tokio::fs::File::open(&entry.path).await {
        Ok(file) => Ok(OpenFile::new(file, ctx.sessions.track_handle())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::not_found("entry", entry.id).into())
        }
        Err(e) => Err(Error::from(e).into()),
    }
}

async fn file_len(file: &OpenFile) -> Result<u64, AppError> {
    Ok(file.metadata().await.map_err(Error::from)?.len())
}

async fn file_size(entry: &MediaEntry) -> Result<u64, AppError> {
    match tokio::fs::metadata(&entry.path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::not_found("entry", entry.id).into())
        }
        Err(e) => Err(Error::from(e).into()),
    }
}

/// IMF-fixdate, as used by `Last-Modified`.
pub fn http_date(ts: &DateTime<Utc>) -> HeaderValue {
    let s = ts.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    HeaderValue::from_str(&s).unwrap_or_else(|_| HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn http_date_format() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(http_date(&ts), "Tue, 05 Mar 2024 07:08:09 GMT");
    }
}
