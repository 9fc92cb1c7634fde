//! WebSocket upgrade handler

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use dashmap::DashSet;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::app::AppState;
use crate::game::model::Player;
use crate::http::routes::AppError;
use crate::util::rate_limit::PlayerRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Session name issued by `POST /api/session`
    pub username: String,
}

/// Only match topics can be subscribed to
fn accepts_destination(destination: &str) -> bool {
    let topic = destination
        .strip_prefix("lobby/")
        .or_else(|| destination.strip_prefix("game/"));
    matches!(topic, Some(rest) if !rest.is_empty())
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    // Resolve the session before upgrading
    let player = state.service.resolve_player(&query.username).await?;
    info!(username = %player.username, "WebSocket upgrade for session");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, player, state)))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, player: Player, state: AppState) {
    info!(username = %player.username, "New WebSocket connection");

    let (mut ws_sink, ws_stream) = socket.split();

    // Send welcome message
    let welcome = ServerMsg::Welcome {
        username: player.username.clone(),
        player_id: player.id,
        instance_id: state.fanout.instance_id().to_string(),
        server_time: unix_millis(),
    };

    if let Err(e) = send_msg(&mut ws_sink, &welcome).await {
        error!(username = %player.username, error = %e, "Failed to send welcome");
        return;
    }

    run_session(player.clone(), state, ws_sink, ws_stream).await;

    info!(username = %player.username, "WebSocket connection closed");
}

/// Run the WebSocket session with read/write split
async fn run_session(
    player: Player,
    state: AppState,
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut ws_stream: SplitStream<WebSocket>,
) {
    let rate_limiter = PlayerRateLimiter::new();
    let subscriptions: Arc<DashSet<String>> = Arc::new(DashSet::new());
    let (direct_tx, mut direct_rx) = mpsc::channel::<ServerMsg>(32);
    let mut events = state.fanout.subscribe_local();

    // Spawn writer task: direct replies + subscribed events -> WebSocket
    let writer_name = player.username.clone();
    let writer_subscriptions = subscriptions.clone();
    let writer_handle = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                direct = direct_rx.recv() => match direct {
                    Some(msg) => msg,
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(event) if writer_subscriptions.contains(&event.destination) => {
                        ServerMsg::Event {
                            destination: event.destination.clone(),
                            payload: event.payload.clone(),
                        }
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(
                            username = %writer_name,
                            lagged_count = n,
                            "Client lagged, skipping {} events", n
                        );
                        // Continue - don't disconnect for lag
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(username = %writer_name, "Event hub closed");
                        break;
                    }
                },
            };

            if let Err(e) = send_msg(&mut ws_sink, &msg).await {
                debug!(username = %writer_name, error = %e, "WebSocket send failed");
                break;
            }
        }
    });

    // Reader loop: WebSocket -> services
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_input() {
                    warn!(username = %player.username, "Rate limited input message");
                    continue;
                }

                let reply = match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(client_msg) => handle_client_msg(&state, &player, &subscriptions, client_msg).await,
                    Err(e) => {
                        warn!(username = %player.username, error = %e, "Failed to parse client message");
                        Some(ServerMsg::error("bad_message", "Malformed message"))
                    }
                };

                if let Some(reply) = reply {
                    if direct_tx.send(reply).await.is_err() {
                        debug!(username = %player.username, "Writer gone");
                        break;
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(username = %player.username, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(username = %player.username, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(username = %player.username, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // Abort writer task
    writer_handle.abort();
}

async fn handle_client_msg(
    state: &AppState,
    player: &Player,
    subscriptions: &DashSet<String>,
    msg: ClientMsg,
) -> Option<ServerMsg> {
    match msg {
        ClientMsg::Subscribe { destination } => {
            if !accepts_destination(&destination) {
                return Some(ServerMsg::error("bad_destination", "Unknown destination"));
            }
            debug!(username = %player.username, destination = %destination, "Subscribed");
            subscriptions.insert(destination);
            None
        }
        ClientMsg::Unsubscribe { destination } => {
            subscriptions.remove(&destination);
            None
        }
        ClientMsg::Move {
            code,
            avatar_id,
            dx,
            dy,
        } => match state
            .service
            .move_player(&code, &player.username, avatar_id, dx, dy)
            .await
        {
            Ok(_) => None,
            Err(e) => Some(ServerMsg::error(e.kind(), e.to_string())),
        },
        ClientMsg::Ping { t } => Some(ServerMsg::Pong { t }),
    }
}

/// Send a message over WebSocket
async fn send_msg(sink: &mut SplitSink<WebSocket, Message>, msg: &ServerMsg) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_match_topics_are_subscribable() {
        assert!(accepts_destination("game/ABC123"));
        assert!(accepts_destination("game/ABC123/vote/result"));
        assert!(accepts_destination("lobby/ABC123"));
        assert!(!accepts_destination("game/"));
        assert!(!accepts_destination("admin/everything"));
    }
}
