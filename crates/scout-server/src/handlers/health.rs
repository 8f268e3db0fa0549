//! Health check handler.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// Model facts and session utilization.
pub async fn handle_health(State(state): State<AppState>) -> Json<Value> {
    let info = state.model.info();
    Json(json!({
        "status": "ok",
        "model": {
            "name": state.model_name,
            "architecture": info.architecture,
            "context_capacity": info.context_capacity,
            "quantization": info.quantization,
        },
        "sessions": {
            "held": state.sessions.session_count().await,
            "max_sessions": state.sessions.max_sessions(),
            "max_concurrent_turns": state.sessions.max_concurrent(),
            "available_turns": state.sessions.available_permits(),
        }
    }))
}
