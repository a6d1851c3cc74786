use std::sync::Arc;

use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::app_state::AppState;
use super::rest_api;

/// Build the axum router with all HTTP and SSE routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Streams
        .route("/api/groups", axum::routing::get(rest_api::watch_groups))
        .route(
            "/api/groups/{group_id}/channels",
            axum::routing::get(rest_api::watch_channels),
        )
        .route(
            "/api/groups/{group_id}/status",
            axum::routing::get(rest_api::watch_status),
        )
        .route("/api/sounds", axum::routing::get(rest_api::watch_sounds))
        .route("/api/session", axum::routing::get(rest_api::session_status))
        // Commands
        .route(
            "/api/groups/{group_id}/channels/{channel_id}/join",
            axum::routing::post(rest_api::join_channel),
        )
        .route(
            "/api/groups/{group_id}/leave",
            axum::routing::post(rest_api::leave_group),
        )
        .route(
            "/api/groups/{group_id}/play",
            axum::routing::post(rest_api::play_sound),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
