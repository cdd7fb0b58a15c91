mod handler;
mod session;

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use palaver_core::AppState;
use palaver_models::CallChannel;
use serde::Deserialize;
use serde_json::json;

use handler::Hub;

/// The three gateway endpoints plus a liveness probe. One hub per endpoint;
/// a client holds up to three sockets (chat, audio signaling, video
/// signaling), each with its own presence registry.
pub fn gateway_router() -> Router<AppState> {
    Router::new()
        .route("/gateway/chat", get(chat_upgrade))
        .route("/gateway/call/audio", get(audio_upgrade))
        .route("/gateway/call/video", get(video_upgrade))
        .route("/healthz", get(healthz))
}

#[derive(Debug, Default, Deserialize)]
struct GatewayQuery {
    /// JWT; clients that cannot set headers pass it here instead of in the
    /// join frame.
    token: Option<String>,
}

async fn chat_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<GatewayQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_connection(socket, state, Hub::Chat, query.token))
}

async fn audio_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<GatewayQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        handler::handle_connection(socket, state, Hub::Call(CallChannel::Audio), query.token)
    })
}

async fn video_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<GatewayQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        handler::handle_connection(socket, state, Hub::Call(CallChannel::Video), query.token)
    })
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "name": "palaver",
            "version": env!("CARGO_PKG_VERSION"),
            "online": {
                "chat": state.chat.len(),
                "audio": state.audio_calls.presence().len(),
                "video": state.video_calls.presence().len(),
            },
            "active_calls": state.audio_calls.room_count() + state.video_calls.room_count(),
        })),
    )
}
