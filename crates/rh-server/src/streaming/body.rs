//! Per-session producer task and response body.
//!
//! The producer owns the session's file handle and reads one chunk at a time
//! into a small bounded channel, reserving a slot before each read so a
//! client that stops reading stalls only its own producer. The body side
//! counts bytes as the connection takes them and completes the session when
//! the last byte of the span has been taken. Dropping the body aborts the
//! session as `ClientGone`.

use std::io::SeekFrom;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;

use super::range::ByteRange;
use super::sessions::{AbortReason, HandleGuard, SessionHandle};

/// Chunks buffered between producer and connection.
const CHANNEL_DEPTH: usize = 2;

type Chunk = std::io::Result<Bytes>;

/// A file opened for one session, with its handle counted in the registry.
pub struct OpenFile {
    file: File,
    _guard: HandleGuard,
}

impl OpenFile {
    pub fn new(file: File, guard: HandleGuard) -> Self {
        Self {
            file,
            _guard: guard,
        }
    }

    pub async fn metadata(&self) -> std::io::Result<std::fs::Metadata> {
        self.file.metadata().await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProducerOptions {
    pub chunk_size: usize,
    pub stall_timeout: Duration,
}

/// Spawn the producer for `range` of `file` and return the body that
/// drains it.
pub fn stream_body(
    file: OpenFile,
    range: ByteRange,
    session: Arc<SessionHandle>,
    options: ProducerOptions,
) -> Body {
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    tokio::spawn(produce(file, range, tx, session.clone(), options));
    Body::from_stream(SessionBody {
        rx,
        remaining: range.len(),
        session,
    })
}

async fn produce(
    mut file: OpenFile,
    range: ByteRange,
    tx: mpsc::Sender<Chunk>,
    session: Arc<SessionHandle>,
    options: ProducerOptions,
) {
    session.mark_streaming();

    if let Err(e) = file.file.seek(SeekFrom::Start(range.start)).await {
        tracing::warn!(session_id = %session.id(), error = %e, "Seek failed");
        session.abort(AbortReason::ReadFailed);
        let _ = tx.send(Err(e)).await;
        return;
    }

    let cancel = session.cancel_token().clone();
    let mut remaining = range.len();

    while remaining > 0 {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                session.abort(AbortReason::Shutdown);
                return;
            }
            reserved = tokio::time::timeout(options.stall_timeout, tx.reserve()) => match reserved {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    session.abort(AbortReason::ClientGone);
                    return;
                }
                Err(_) => {
                    tracing::info!(
                        session_id = %session.id(),
                        bytes_served = session.bytes_served(),
                        "Client stopped reading, aborting session"
                    );
                    session.abort(AbortReason::WriteStalled);
                    return;
                }
            },
        };

        let want = remaining.min(options.chunk_size as u64) as usize;
        let mut buf = BytesMut::zeroed(want);
        match read_full(&mut file.file, &mut buf).await {
            Ok(n) if n == want => {
                remaining -= n as u64;
                permit.send(Ok(buf.freeze()));
            }
            Ok(n) => {
                tracing::warn!(
                    session_id = %session.id(),
                    expected = want,
                    read = n,
                    "File shrank while streaming"
                );
                session.abort(AbortReason::ReadFailed);
                permit.send(Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "file shorter than advertised",
                )));
                return;
            }
            Err(e) => {
                tracing::warn!(session_id = %session.id(), error = %e, "Read failed while streaming");
                session.abort(AbortReason::ReadFailed);
                permit.send(Err(e));
                return;
            }
        }
    }
}

/// Read until `buf` is full or the file ends. Returns bytes read.
async fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Response body stream; completes or aborts its session.
struct SessionBody {
    rx: mpsc::Receiver<Chunk>,
    remaining: u64,
    session: Arc<SessionHandle>,
}

impl Stream for SessionBody {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                let n = bytes.len() as u64;
                self.remaining = self.remaining.saturating_sub(n);
                self.session.add_bytes(n);
                if self.remaining == 0 {
                    self.session.complete();
                }
                Poll::Ready(Some(Ok(bytes)))
            }
            other => other,
        }
    }
}

impl Drop for SessionBody {
    fn drop(&mut self) {
        self.session.abort(AbortReason::ClientGone);
    }
}
