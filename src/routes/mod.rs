use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::state::RelayState;

pub mod health;
pub mod student_ws;
pub mod teacher_ws;

pub fn router(state: Arc<RelayState>) -> Router {
    let ws_prefix = state.config.session_path.trim_end_matches('/').to_string();

    Router::new()
        .route("/", get(health::root))
        .route("/api/health", get(health::health))
        .route(
            &format!("{ws_prefix}/student/:student_id"),
            get(student_ws::student_ws),
        )
        .route(
            &format!("{ws_prefix}/teacher/:teacher_id"),
            get(teacher_ws::teacher_ws),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Listen on every interface at `port` (0 picks a free one).
pub async fn bind(port: u16) -> std::io::Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind(("0.0.0.0", port)).await
}

/// Serve the relay on an already-bound listener until the task is dropped.
pub async fn serve(listener: tokio::net::TcpListener, state: Arc<RelayState>) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_reports_a_taken_port() {
        let held = bind(0).await.unwrap();
        let port = held.local_addr().unwrap().port();
        assert!(bind(port).await.is_err());

        drop(held);
        assert!(bind(0).await.is_ok());
    }
}
