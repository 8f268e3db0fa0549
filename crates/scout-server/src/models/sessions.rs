//! Bodies for the `/v1/sessions` endpoints.

use chrono::{DateTime, Utc};
use scout_engine::GenerationResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::common::{ChatMessage, SamplerOverrides};

/// `POST /v1/sessions`
#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub system: Option<String>,
    /// Session-wide sampling defaults.
    #[serde(default, flatten)]
    pub sampling: SamplerOverrides,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub model: String,
    pub context_capacity: usize,
    pub token_count: usize,
    pub messages: Vec<ChatMessage>,
}

/// `POST /v1/sessions/{id}/messages`
#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub content: String,
    #[serde(default = "default_role")]
    pub role: String,
    /// Stream the reply as SSE. Defaults to true.
    #[serde(default = "default_stream")]
    pub stream: bool,
    /// Overrides for this turn only.
    #[serde(default, flatten)]
    pub sampling: SamplerOverrides,
}

fn default_role() -> String {
    "user".to_string()
}

fn default_stream() -> bool {
    true
}

/// Non-streaming reply to a posted message.
#[derive(Debug, Serialize, Deserialize)]
pub struct TurnResponse {
    pub session_id: Uuid,
    pub message: ChatMessage,
    pub result: GenerationResult,
}
