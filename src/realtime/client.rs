use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};

use super::hub::ConnectionId;
use super::message::{ClientCommand, ServerEvent};
use crate::auth::AuthUser;
use crate::engine::{location, rides};
use crate::error::AppError;
use crate::state::AppState;

const WRITE_WAIT: Duration = Duration::from_secs(10);
const READ_DEADLINE: Duration = Duration::from_secs(60);
/// Must stay below `READ_DEADLINE` so a healthy peer's pong always lands
/// in time.
const PING_PERIOD: Duration = Duration::from_secs(54);
pub const MAX_FRAME_BYTES: usize = 4096;

pub async fn serve_connection(socket: WebSocket, caller: AuthUser, state: Arc<AppState>) {
    let conn = state.hub.next_connection_id();
    let (outbound_tx, outbound_rx) = mpsc::channel(state.config.client_send_buffer);
    if let Err(err) = state.hub.register(conn, caller.user_id, outbound_tx).await {
        warn!(conn, error = %err, "could not register websocket");
        return;
    }

    info!(conn, user_id = %caller.user_id, role = %caller.role, "websocket client connected");

    let (sink, stream) = socket.split();
    let mut send_task = tokio::spawn(write_loop(sink, outbound_rx, conn));
    let mut recv_task = tokio::spawn(read_loop(stream, caller, conn, state.clone()));

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.unregister(conn).await;
    info!(conn, user_id = %caller.user_id, "websocket client disconnected");
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    conn: ConnectionId,
) {
    let mut ping = interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);

    loop {
        let frame = tokio::select! {
            message = outbound.recv() => match message {
                Some(text) => Message::Text(text.into()),
                None => {
                    // hub dropped us
                    let _ = timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
                    return;
                }
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        match timeout(WRITE_WAIT, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(conn, error = %err, "websocket write failed");
                return;
            }
            Err(_) => {
                warn!(conn, "websocket write timed out");
                return;
            }
        }
    }
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    caller: AuthUser,
    conn: ConnectionId,
    state: Arc<AppState>,
) {
    loop {
        let frame = match timeout(READ_DEADLINE, stream.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(err))) => {
                debug!(conn, error = %err, "websocket read failed");
                return;
            }
            Ok(None) => return,
            Err(_) => {
                info!(conn, "websocket read deadline elapsed");
                return;
            }
        };

        match frame {
            Message::Text(text) => handle_text(&state, caller, conn, &text).await,
            Message::Binary(_) => reply_error(
                &state,
                conn,
                "binary frames are not supported".to_string(),
                None,
            ),
            Message::Close(_) => return,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

/// Decodes and runs one inbound command. Failures are reported back to the
/// sending connection only; the connection stays open.
pub async fn handle_text(state: &AppState, caller: AuthUser, conn: ConnectionId, text: &str) {
    let command = match ClientCommand::decode(text) {
        Ok(command) => command,
        Err(err) => {
            warn!(conn, error = %err, "rejected inbound message");
            let request_type = err.request_type().map(str::to_string);
            reply_error(state, conn, err.to_string(), request_type);
            return;
        }
    };

    let kind = command.kind();
    match execute(state, caller, command).await {
        Ok(Some(event)) => state.hub.send_to_connection(conn, &event),
        Ok(None) => {}
        Err(err) => {
            warn!(conn, request_type = kind, error = %err, "inbound command failed");
            reply_error(state, conn, err.public_message(), Some(kind.to_string()));
        }
    }
}

/// Runs `command` as `caller`. Lifecycle commands echo the resulting ride
/// back to the caller.
async fn execute(
    state: &AppState,
    caller: AuthUser,
    command: ClientCommand,
) -> Result<Option<ServerEvent>, AppError> {
    let event = match command {
        ClientCommand::AcceptRide { ride_id } => {
            ServerEvent::RideAccepted(rides::accept(state, caller, ride_id).await?)
        }
        ClientCommand::StartRide { ride_id, otp } => {
            ServerEvent::RideStarted(rides::start_with_otp(state, caller, ride_id, &otp).await?)
        }
        ClientCommand::CompleteRide { ride_id } => {
            ServerEvent::RideCompleted(rides::complete(state, caller, ride_id).await?)
        }
        ClientCommand::CancelRide { ride_id } => {
            ServerEvent::RideCancelled(rides::cancel(state, caller, ride_id).await?)
        }
        ClientCommand::DriverLocationUpdate(update) => {
            location::update_location(state, caller, &update)?;
            return Ok(None);
        }
    };
    Ok(Some(event))
}

fn reply_error(state: &AppState, conn: ConnectionId, message: String, request_type: Option<String>) {
    state.hub.send_to_connection(
        conn,
        &ServerEvent::Error {
            message,
            request_type,
        },
    );
}
