//! Axum router construction.

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::context::AppContext;
use crate::routes;

/// Build the complete Axum router.
pub fn build_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    let api_routes = Router::new()
        .route("/entries/{*id}", get(routes::entries::get_entry))
        .route("/sessions", get(routes::sessions::list_sessions));

    Router::new()
        .route("/health", get(routes::health::health))
        .route("/media", get(routes::media::list_media))
        .route(
            "/media/{*id}",
            get(routes::media::stream_media).head(routes::media::head_media),
        )
        .nest("/api", api_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}
