use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;

use crate::auth::AuthUser;
use crate::realtime::client::{serve_connection, MAX_FRAME_BYTES};
use crate::state::AppState;

/// Authenticates before upgrading; a missing or bad token never gets a
/// socket.
pub async fn ws_handler(
    caller: AuthUser,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| serve_connection(socket, caller, state))
}
