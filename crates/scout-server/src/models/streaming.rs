//! Streaming chunk types for chat completions.

use serde::{Deserialize, Serialize};

/// Chat completion chunk for streaming responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoiceDelta>,
}

impl ChatCompletionChunk {
    pub fn new(id: &str, created: u64, model: &str, delta: ChatDelta, finish: Option<String>) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChatChoiceDelta {
                index: 0,
                delta,
                finish_reason: finish,
            }],
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatChoiceDelta {
    pub index: usize,
    pub delta: ChatDelta,
    pub finish_reason: Option<String>,
}

/// Incremental content.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ChatDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}
