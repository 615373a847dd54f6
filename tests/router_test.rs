//! Router-level tests driven with `tower::ServiceExt::oneshot`.

mod common;

use std::path::Path;

use assert_matches::assert_matches;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use rh_core::{EntryState, MediaEntry, MediaMetadata};
use rh_server::router::build_router;
use rh_server::AppContext;
use tower::ServiceExt;

use common::memory_context;

fn entry(path: &str, state: EntryState) -> MediaEntry {
    let now = Utc::now();
    let mut e = MediaEntry::pending(path, 1_234, now, now);
    e.state = state;
    if state == EntryState::Indexed {
        e.content_hash = "abc123".into();
        e.metadata = Some(MediaMetadata {
            container: "flac".into(),
            mime_type: "audio/flac".into(),
            extractor: "sniff".into(),
            ..Default::default()
        });
    }
    e
}

fn seeded() -> AppContext {
    let ctx = memory_context(vec!["/music".into()]);
    ctx.store.upsert(&entry("/music/a.flac", EntryState::Indexed)).unwrap();
    ctx.store.upsert(&entry("/music/b.flac", EntryState::Indexed)).unwrap();
    ctx.store.upsert(&entry("/music/c.flac", EntryState::Pending)).unwrap();
    ctx.store.upsert(&entry("/music/d.flac", EntryState::Stale)).unwrap();
    ctx
}

async fn get_json(ctx: &AppContext, uri: &str) -> (StatusCode, serde_json::Value) {
    let resp = build_router(ctx.clone())
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn health_reports_store_and_counts() {
    let ctx = seeded();
    let (status, body) = get_json(&ctx, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], "healthy");
    assert_eq!(body["entries"]["indexed"], 2);
    assert_eq!(body["entries"]["pending"], 1);
    assert_eq!(body["entries"]["stale"], 1);
    assert_eq!(body["sessions"]["active"], 0);
}

#[tokio::test]
async fn listing_defaults_to_indexed() {
    let ctx = seeded();
    let (status, body) = get_json(&ctx, "/media").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    let items = body["items"].as_array().unwrap();
    assert_eq!(items[0]["path"], "/music/a.flac");
    assert_eq!(items[0]["relative_path"], "a.flac");
    assert_eq!(items[0]["state"], "indexed");
    assert_eq!(items[0]["metadata"]["container"], "flac");
}

#[tokio::test]
async fn listing_filters_by_state() {
    let ctx = seeded();
    let (_, pending) = get_json(&ctx, "/media?state=pending").await;
    assert_eq!(pending["count"], 1);
    assert_eq!(pending["items"][0]["path"], "/music/c.flac");

    let (_, all) = get_json(&ctx, "/media?state=all").await;
    assert_eq!(all["count"], 4);

    let (status, body) = get_json(&ctx, "/media?state=bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");
}

#[tokio::test]
async fn entry_detail_by_path_and_id() {
    let ctx = seeded();
    let stored = ctx.store.get(Path::new("/music/c.flac")).unwrap().unwrap();

    let (status, body) = get_json(&ctx, "/api/entries/c.flac").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], stored.id.to_string());
    assert_eq!(body["state"], "pending");
    assert_eq!(body["servable"], false);

    let (status, body) = get_json(&ctx, &format!("/api/entries/{}", stored.id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["path"], "/music/c.flac");

    let (status, _) = get_json(&ctx, "/api/entries/missing.flac").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stale_entry_is_not_ready() {
    let ctx = seeded();
    let resp = build_router(ctx)
        .oneshot(
            Request::builder()
                .uri("/media/d.flac")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_matches!(resp.headers().get("retry-after"), Some(v) if v == "2");
}

#[tokio::test]
async fn indexed_entry_with_missing_file_is_404() {
    let ctx = seeded();
    let resp = build_router(ctx)
        .oneshot(
            Request::builder()
                .method(Method::HEAD)
                .uri("/media/a.flac")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sessions_endpoint_is_empty_when_idle() {
    let ctx = seeded();
    let (status, body) = get_json(&ctx, "/api/sessions").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"].as_array().unwrap().len(), 0);
    assert_eq!(body["totals"]["completed"], 0);
}

#[tokio::test]
async fn media_routes_answer_recovering_while_store_is_rebuilt() {
    let ctx = seeded();
    let id = ctx.store.get(Path::new("/music/a.flac")).unwrap().unwrap().id;
    ctx.store.simulate_corruption("database disk image is malformed");

    for uri in ["/media".to_string(), format!("/media/{id}"), "/media/a.flac".to_string()] {
        let (status, body) = get_json(&ctx, &uri).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{uri}");
        assert_eq!(body["code"], "recovering", "{uri}");
    }

    let (status, body) = get_json(&ctx, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["store"], "corrupt");
}

#[tokio::test]
async fn reset_store_is_empty_and_healthy() {
    let ctx = seeded();
    let store = ctx.store.clone();
    let mut health = store.subscribe_health();
    let resetting = tokio::task::spawn_blocking(move || store.reset());
    resetting.await.unwrap().unwrap();
    assert_eq!(*health.borrow_and_update(), rh_db::StoreHealth::Healthy);

    // After the reset the store is empty and healthy again.
    let (status, body) = get_json(&ctx, "/media?state=all").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
}
