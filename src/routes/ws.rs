//! WebSocket handler: the collaboration transport.
//!
//! DESIGN
//! ======
//! On upgrade, assigns a connection ID, registers an outbound queue with the
//! hub, and enters a `select!` loop:
//! - Incoming client events → parse + dispatch to the session manager
//! - Events fanned out by the session layer → forward to this socket
//!
//! Session operations deliver through the hub. The only events written
//! directly to the socket are errors for the sender's own request.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → register outbound queue
//! 2. Client sends events → dispatch → session manager fans out
//! 3. Close → session disconnect (presence update to the room) → unregister
//!
//! On server shutdown every socket sends a close frame and runs step 3, so no
//! edit can arrive after the final save flush.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::{ClientEvent, ConnectionId, ServerEvent};
use crate::state::AppState;

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4();

    // Per-connection queue for events fanned out by the session layer.
    let (client_tx, mut client_rx) = mpsc::channel::<ServerEvent>(state.client_channel_capacity);
    state.sessions.hub().register(connection_id, client_tx);

    let mut shutdown = state.shutdown_rx();
    info!(%connection_id, "ws: client connected");

    loop {
        if *shutdown.borrow_and_update() {
            let _ = socket.send(Message::Close(None)).await;
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => continue,
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_inbound_text(&state, connection_id, text.as_str()).await;
                        if send_events(&mut socket, &replies).await.is_err() {
                            break;
                        }
                    }
                    Message::Binary(_) => {
                        let reply = ServerEvent::error("binary messages are not supported");
                        if send_event(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(event) = client_rx.recv() => {
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
        }
    }

    state.sessions.disconnect(connection_id);
    state.sessions.hub().unregister(connection_id);
    info!(
        %connection_id,
        connections = state.sessions.hub().connection_count(),
        rooms = state.sessions.registry().room_count(),
        bound = state.sessions.registry().binding_count(),
        "ws: client disconnected"
    );
}

// =============================================================================
// EVENT DISPATCH
// =============================================================================

/// Parse and dispatch one inbound text message. Returns events for the
/// sender only; everything else goes out through the hub.
async fn process_inbound_text(state: &AppState, connection_id: ConnectionId, text: &str) -> Vec<ServerEvent> {
    let event = match ClientEvent::parse(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(%connection_id, error = %e, "ws: invalid inbound event");
            return vec![ServerEvent::error_from(&e)];
        }
    };
    debug!(%connection_id, event = event.name(), "ws: recv");

    match event {
        ClientEvent::JoinDocument(req) => {
            info!(%connection_id, document_id = %req.document_id, user_id = %req.user_id, "ws: recv join-document");
            let document_id = req.document_id.clone();
            match state.sessions.join(connection_id, req).await {
                Ok(()) => vec![],
                Err(e) => {
                    warn!(%connection_id, %document_id, error = %e, "ws: join failed");
                    vec![ServerEvent::error_from(&e)]
                }
            }
        }
        ClientEvent::LeaveDocument(req) => {
            info!(%connection_id, document_id = %req.document_id, user_id = %req.user_id, "ws: recv leave-document");
            state.sessions.leave(connection_id, req);
            vec![]
        }
        ClientEvent::ContentChange(change) => {
            state.sessions.change_content(connection_id, change);
            vec![]
        }
        ClientEvent::CursorMove(mv) => {
            state.sessions.move_cursor(connection_id, mv);
            vec![]
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_events(socket: &mut WebSocket, events: &[ServerEvent]) -> Result<(), ()> {
    for event in events {
        send_event(socket, event).await?;
    }
    Ok(())
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let json = match serde_json::to_string(event) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, event = event.name(), "ws: failed to serialize event");
            return Err(());
        }
    };
    if let ServerEvent::Error(err) = event {
        let code = err.code.as_deref().unwrap_or("-");
        warn!(code, message = %err.message, "ws: send error event");
    }
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
