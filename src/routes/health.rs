use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::state::RelayState;

pub async fn root() -> Json<Value> {
    Json(json!({
        "status": "active",
        "service": "SmartSession relay",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339()
    }))
}

pub async fn health(State(state): State<Arc<RelayState>>) -> Json<Value> {
    let uptime = Utc::now()
        .signed_duration_since(state.start_time)
        .num_seconds();

    Json(json!({
        "status": "healthy",
        "active_students": state.students.len(),
        "active_teachers": state.teachers.len(),
        "analyzer_ready": state.analyzer.is_ready(),
        "uptime_secs": uptime,
        "timestamp": Utc::now().to_rfc3339()
    }))
}
