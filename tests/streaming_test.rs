//! End-to-end tests for `GET`/`HEAD /media/{id}` over a real socket.

mod common;

use std::time::Duration;

use common::{wav, TestHarness};
use rh_core::events::EventPayload;
use rh_core::{EntryState, WatchEvent};
use rh_server::streaming::SessionState;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpSocket;

#[tokio::test]
async fn full_file_without_range() {
    let h = TestHarness::start().await;
    let entry = h.add_wav("song.wav", 4_000).await;

    let resp = reqwest::get(h.url("/media/song.wav")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let headers = resp.headers().clone();
    assert_eq!(headers["content-type"], "audio/wav");
    assert_eq!(headers["accept-ranges"], "bytes");
    assert_eq!(headers["content-length"], "4044");
    assert_eq!(headers["etag"], format!("\"{}\"", entry.content_hash).as_str());
    assert!(headers.contains_key("last-modified"));

    let body = resp.bytes().await.unwrap();
    assert_eq!(body.as_ref(), wav(4_000).as_slice());

    assert!(h.ctx().sessions.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(h.ctx().sessions.totals().completed, 1);
    h.stop().await;
}

#[tokio::test]
async fn served_by_id_as_well_as_path() {
    let h = TestHarness::start().await;
    let entry = h.add_wav("albums/a/one.wav", 100).await;

    let by_id = reqwest::get(h.url(&format!("/media/{}", entry.id))).await.unwrap();
    assert_eq!(by_id.status(), 200);
    let by_path = reqwest::get(h.url("/media/albums/a/one.wav")).await.unwrap();
    assert_eq!(by_path.status(), 200);
    assert_eq!(by_id.bytes().await.unwrap(), by_path.bytes().await.unwrap());
    h.stop().await;
}

#[tokio::test]
async fn range_requests() {
    let h = TestHarness::start().await;
    h.add_wav("song.wav", 956).await; // 1000 bytes total
    let data = wav(956);
    let client = reqwest::Client::new();

    let cases = [
        ("bytes=0-99", 0usize, 99usize),
        ("bytes=900-", 900, 999),
        ("bytes=-10", 990, 999),
        ("bytes=500-5000", 500, 999),
    ];
    for (range, start, end) in cases {
        let resp = client
            .get(h.url("/media/song.wav"))
            .header("Range", range)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 206, "{range}");
        assert_eq!(
            resp.headers()["content-range"],
            format!("bytes {start}-{end}/1000").as_str()
        );
        assert_eq!(
            resp.headers()["content-length"],
            (end - start + 1).to_string().as_str()
        );
        let body = resp.bytes().await.unwrap();
        assert_eq!(body.as_ref(), &data[start..=end], "{range}");
    }
    h.stop().await;
}

#[tokio::test]
async fn unsatisfiable_range_is_416() {
    let h = TestHarness::start().await;
    h.add_wav("song.wav", 956).await;

    let resp = reqwest::Client::new()
        .get(h.url("/media/song.wav"))
        .header("Range", "bytes=1000-")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 416);
    assert_eq!(resp.headers()["content-range"], "bytes */1000");
    assert_eq!(h.ctx().sessions.totals().active, 0);
    h.stop().await;
}

#[tokio::test]
async fn malformed_range_is_400() {
    let h = TestHarness::start().await;
    h.add_wav("song.wav", 100).await;
    let client = reqwest::Client::new();

    for range in ["bytes=abc", "bytes=10-5", "items=0-1", "bytes=--1", "bytes=abc,def"] {
        let resp = client
            .get(h.url("/media/song.wav"))
            .header("Range", range)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "{range}");
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "bad_request");
    }
    h.stop().await;
}

#[tokio::test]
async fn multi_range_gets_full_content() {
    let h = TestHarness::start().await;
    h.add_wav("song.wav", 956).await;

    let resp = reqwest::Client::new()
        .get(h.url("/media/song.wav"))
        .header("Range", "bytes=0-1,5-9")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.bytes().await.unwrap().len(), 1000);
    h.stop().await;
}

#[tokio::test]
async fn head_opens_no_session() {
    let h = TestHarness::start().await;
    h.add_wav("song.wav", 956).await;

    let resp = reqwest::Client::new()
        .head(h.url("/media/song.wav"))
        .header("Range", "bytes=0-9")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(resp.headers()["content-length"], "10");
    assert_eq!(resp.headers()["content-range"], "bytes 0-9/1000");

    let totals = h.ctx().sessions.totals();
    assert_eq!(totals.completed + totals.aborted + totals.active as u64, 0);
    h.stop().await;
}

#[tokio::test]
async fn unknown_entry_is_404() {
    let h = TestHarness::start().await;
    let resp = reqwest::get(h.url("/media/nope.wav")).await.unwrap();
    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "not_found");
    h.stop().await;
}

#[tokio::test]
async fn parent_segments_are_rejected() {
    let h = TestHarness::start().await;
    // Encoded so the client does not normalize the path away.
    let resp = reqwest::get(h.url("/media/..%2F..%2Fetc%2Fpasswd")).await.unwrap();
    assert_eq!(resp.status(), 400);
    h.stop().await;
}

#[tokio::test]
async fn removed_entry_is_404() {
    let h = TestHarness::start().await;
    let entry = h.add_wav("song.wav", 100).await;
    std::fs::remove_file(&entry.path).unwrap();
    h.submit(WatchEvent::removed(&entry.path)).await;

    let resp = reqwest::get(h.url("/media/song.wav")).await.unwrap();
    assert_eq!(resp.status(), 404);
    let resp = reqwest::get(h.url(&format!("/media/{}", entry.id))).await.unwrap();
    assert_eq!(resp.status(), 404);
    h.stop().await;
}

#[tokio::test]
async fn pending_entry_is_503_with_retry_after() {
    let h = TestHarness::start().await;
    let path = h.write_media("broken.mp3", b"definitely not audio data");
    h.submit(WatchEvent::created(&path)).await;

    let resp = reqwest::get(h.url("/media/broken.mp3")).await.unwrap();
    assert_eq!(resp.status(), 503);
    assert_eq!(resp.headers()["retry-after"], "2");
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "not_ready");
    h.stop().await;
}

#[tokio::test]
async fn client_disconnect_aborts_session() {
    let h = TestHarness::start().await;
    h.add_wav("big.wav", 16 * 1024 * 1024).await;

    let mut resp = reqwest::get(h.url("/media/big.wav")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let first = resp.chunk().await.unwrap().unwrap();
    assert!(!first.is_empty());
    assert_eq!(h.ctx().sessions.active_count(), 1);
    drop(resp);

    assert!(h.ctx().sessions.wait_idle(Duration::from_secs(10)).await);
    let totals = h.ctx().sessions.totals();
    assert_eq!(totals.aborted, 1);
    assert_eq!(totals.completed, 0);
    assert_eq!(totals.open_handles, 0);

    let aborted = h.events().recent_events(100).into_iter().find_map(|e| match e.payload {
        EventPayload::SessionAborted { reason, .. } => Some(reason),
        _ => None,
    });
    assert_eq!(aborted.as_deref(), Some("client_gone"));
    h.stop().await;
}

#[tokio::test]
async fn concurrent_streams_are_independent() {
    let h = TestHarness::start().await;
    let big = 32 * 1024 * 1024;
    h.add_wav("a.wav", big).await;
    h.add_wav("b.wav", 64 * 1024).await;

    // A raw client with a tiny receive window that never reads its response.
    let socket = TcpSocket::new_v4().unwrap();
    socket.set_recv_buffer_size(4096).unwrap();
    let mut stalled = socket.connect(h.addr()).await.unwrap();
    stalled
        .write_all(b"GET /media/a.wav HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let stalled_id = loop {
        if let Some(s) = h.ctx().sessions.active().first() {
            if s.state == SessionState::Streaming {
                break s.id;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "stalled session never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    // Others are served in full regardless.
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let url = h.url("/media/b.wav");
        tasks.push(tokio::spawn(async move {
            reqwest::get(url).await.unwrap().bytes().await.unwrap().len()
        }));
    }
    for t in tasks {
        assert_eq!(t.await.unwrap(), 64 * 1024 + 44);
    }
    assert_eq!(h.ctx().sessions.totals().completed, 8);

    let session = h.ctx().sessions.get(stalled_id).expect("stalled session still active");
    assert_eq!(session.state, SessionState::Streaming);
    assert!(session.bytes_served < u64::from(big));
    assert_eq!(h.ctx().sessions.active_count(), 1);

    drop(stalled);
    assert!(h.ctx().sessions.wait_idle(Duration::from_secs(10)).await);
    assert_eq!(h.ctx().sessions.totals().aborted, 1);
    h.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn removal_mid_stream_finishes_body_then_404() {
    let h = TestHarness::start().await;
    let data_len = 4 * 1024 * 1024;
    let entry = h.add_wav("song.wav", data_len).await;

    let mut resp = reqwest::get(h.url("/media/song.wav")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let mut body = resp.chunk().await.unwrap().unwrap().to_vec();

    std::fs::remove_file(&entry.path).unwrap();
    h.submit(WatchEvent::removed(&entry.path)).await;
    assert_eq!(h.entry(&entry.path).unwrap().state, EntryState::Removed);

    while let Some(chunk) = resp.chunk().await.unwrap() {
        body.extend_from_slice(&chunk);
    }
    assert_eq!(body, wav(data_len));
    assert!(h.ctx().sessions.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(h.ctx().sessions.totals().completed, 1);

    let again = reqwest::get(h.url("/media/song.wav")).await.unwrap();
    assert_eq!(again.status(), 404);
    let again = reqwest::get(h.url(&format!("/media/{}", entry.id))).await.unwrap();
    assert_eq!(again.status(), 404);
    h.stop().await;
}

#[tokio::test]
async fn stop_aborts_sessions_after_grace() {
    let h = TestHarness::start_with(|c| c.streaming.shutdown_grace_secs = 1).await;
    h.add_wav("big.wav", 8 * 1024 * 1024).await;

    let resp = reqwest::get(h.url("/media/big.wav")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let sessions = h.ctx().sessions.clone();

    h.stop().await;
    let totals = sessions.totals();
    assert_eq!(totals.active, 0);
    assert_eq!(totals.open_handles, 0);
    assert_eq!(totals.aborted, 1);
    drop(resp);
}
