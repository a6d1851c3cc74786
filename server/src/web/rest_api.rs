use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::future::ready;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::app_state::AppState;
use crate::error::BotError;

// ── Error mapping ──────────────────────────────────────────

pub fn status_for(error: &BotError) -> StatusCode {
    match error {
        BotError::Validation(_) => StatusCode::BAD_REQUEST,
        BotError::NotFound(_) => StatusCode::NOT_FOUND,
        BotError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
        BotError::AckTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
    }
}

fn error_response(error: BotError) -> Response {
    let status = status_for(&error);
    if status.is_server_error() {
        warn!(error = %error, "command failed");
    }
    (status, error.to_string()).into_response()
}

// ── SSE helpers ────────────────────────────────────────────

/// Serialize each item as the JSON payload of an SSE event named `name`.
/// The stream ends when the server shuts down.
fn sse_json<T>(
    state: &AppState,
    name: &'static str,
    items: BoxStream<'static, T>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>> + use<T>>
where
    T: Serialize + Send + 'static,
{
    let shutdown = state.shutdown.clone().cancelled_owned();
    let events = items.take_until(shutdown).filter_map(move |item| {
        let event = match serde_json::to_string(&item) {
            Ok(json) => Some(Ok(Event::default().event(name).data(json))),
            Err(e) => {
                error!(stream = name, error = %e, "failed to serialize event");
                None
            }
        };
        ready(event)
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Like [`sse_json`], but a stream that could not be opened is logged and
/// ends immediately.
fn sse_or_end<T>(
    state: &AppState,
    name: &'static str,
    opened: Result<BoxStream<'static, T>, BotError>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>> + use<T>>
where
    T: Serialize + Send + 'static,
{
    let items = opened.unwrap_or_else(|e| {
        error!(stream = name, error = %e, "failed to open stream");
        stream::empty().boxed()
    });
    sse_json(state, name, items)
}

// ── Streams ────────────────────────────────────────────────

/// GET /api/groups: group snapshots.
pub async fn watch_groups(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    sse_or_end(&state, "groups", state.service.watch_groups().await)
}

/// GET /api/groups/{group_id}/channels: voice channel snapshots of a group.
pub async fn watch_channels(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
) -> impl IntoResponse {
    sse_or_end(&state, "channels", state.service.watch_channels(&group_id).await)
}

/// GET /api/groups/{group_id}/status: bot status in a group.
pub async fn watch_status(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
) -> impl IntoResponse {
    sse_or_end(&state, "status", state.service.watch_status(&group_id).await)
}

/// GET /api/sounds: sound library snapshots.
pub async fn watch_sounds(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    sse_json(&state, "sounds", state.service.watch_sounds())
}

/// GET /api/session: current connection state.
pub async fn session_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.service.session_status())
}

// ── Commands ───────────────────────────────────────────────

/// POST /api/groups/{group_id}/channels/{channel_id}/join
pub async fn join_channel(
    State(state): State<Arc<AppState>>,
    Path((group_id, channel_id)): Path<(String, String)>,
) -> Response {
    info!(%group_id, %channel_id, "join requested");
    match state.service.join(&group_id, &channel_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /api/groups/{group_id}/leave
pub async fn leave_group(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
) -> Response {
    info!(%group_id, "leave requested");
    match state.service.leave(&group_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
pub struct PlayParams {
    pub sound_identifier: String,
}

/// POST /api/groups/{group_id}/play?sound_identifier=...
pub async fn play_sound(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
    Query(params): Query<PlayParams>,
) -> Response {
    match state.service.play(&group_id, &params.sound_identifier).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}
