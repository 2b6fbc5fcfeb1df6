// ─────────────────────────────────────────────────────────────────
//  student_ws.rs: capture clients stream frames here
//
//  video_frame  → analysis_result back to the student,
//                 student_update to every teacher
//  ping         → pong
//  on close     → student_disconnected to every teacher
// ─────────────────────────────────────────────────────────────────

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;

use crate::analyzer::decode_frame;
use crate::models::{AnalysisResult, ClientMessage, ServerMessage, StudentState};
use crate::state::{send_message, RelayState};

pub async fn student_ws(
    ws: WebSocketUpgrade,
    Path(student_id): Path<String>,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_student(socket, student_id, state))
}

async fn handle_student(socket: WebSocket, student_id: String, state: Arc<RelayState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();

    // Forward channel → WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let conn_id = state.register_student(&student_id, tx.clone());
    tracing::info!(
        "🎥 Student {student_id} connected (students: {})",
        state.students.len()
    );

    while let Some(Ok(msg)) = ws_rx.next().await {
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };

        let parsed: ClientMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!("Student {student_id}: ignoring message: {e}");
                continue;
            }
        };

        match parsed {
            ClientMessage::VideoFrame { frame } => {
                let Some(analysis) = analyze(&state, &student_id, frame).await else {
                    continue;
                };
                state
                    .latest
                    .insert(student_id.clone(), StudentState::from_analysis(analysis.clone()));

                send_message(&tx, &ServerMessage::AnalysisResult(analysis.clone()));
                state.broadcast_to_teachers(&ServerMessage::StudentUpdate(analysis));
            }
            ClientMessage::Ping => {
                send_message(&tx, &ServerMessage::Pong);
            }
            ClientMessage::RequestState => {}
        }
    }

    // Cleanup
    if state.unregister_student(&student_id, conn_id) {
        tracing::info!(
            "🔌 Student {student_id} disconnected (students: {})",
            state.students.len()
        );
        state.broadcast_to_teachers(&ServerMessage::StudentDisconnected {
            student_id: student_id.clone(),
            timestamp: Utc::now(),
        });
    }

    send_task.abort();
}

/// Decode and analyse off the async workers. `None` when the frame can't be decoded.
async fn analyze(state: &Arc<RelayState>, student_id: &str, frame: String) -> Option<AnalysisResult> {
    let analyzer = state.analyzer.clone();
    let id = student_id.to_string();
    let result = tokio::task::spawn_blocking(move || {
        let image = decode_frame(&frame)?;
        Ok::<_, crate::error::SessionError>(analyzer.analyze(&id, &image))
    })
    .await;

    match result {
        Ok(Ok(mut analysis)) => {
            analysis.student_id = student_id.to_string();
            analysis.timestamp = Some(Utc::now());
            tracing::debug!("Analyzed frame for {student_id}: {:?}", analysis.status);
            Some(analysis)
        }
        Ok(Err(e)) => {
            tracing::debug!("Student {student_id}: undecodable frame: {e}");
            None
        }
        Err(e) => {
            tracing::error!("Student {student_id}: analyzer task failed: {e}");
            None
        }
    }
}
