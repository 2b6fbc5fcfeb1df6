use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;

use crate::models::{ClientMessage, ServerMessage};
use crate::state::{send_message, RelayState};

pub async fn teacher_ws(
    ws: WebSocketUpgrade,
    Path(teacher_id): Path<String>,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_teacher(socket, teacher_id, state))
}

async fn handle_teacher(socket: WebSocket, teacher_id: String, state: Arc<RelayState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Register before taking the snapshot: an update racing the snapshot is
    // either in it or queued behind it.
    let conn_id = state.register_teacher(&teacher_id, tx.clone());
    let initial = ServerMessage::InitialState(state.snapshot());
    send_message(&tx, &initial);
    tracing::info!(
        "👁️  Teacher {teacher_id} connected (teachers: {})",
        state.teachers.len()
    );

    while let Some(Ok(msg)) = ws_rx.next().await {
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Ping) => {
                send_message(&tx, &ServerMessage::Pong);
            }
            Ok(ClientMessage::RequestState) => {
                send_message(&tx, &ServerMessage::StateUpdate(state.snapshot()));
            }
            Ok(ClientMessage::VideoFrame { .. }) => {}
            Err(e) => tracing::debug!("Teacher {teacher_id}: ignoring message: {e}"),
        }
    }

    if state.unregister_teacher(&teacher_id, conn_id) {
        tracing::info!(
            "👁️  Teacher {teacher_id} disconnected (teachers: {})",
            state.teachers.len()
        );
    }

    send_task.abort();
}
