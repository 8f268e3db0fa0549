//! Types shared by the session and chat-completion endpoints.

use std::str::FromStr;

use scout_engine::{FinishReason, GenerationResult, Message, Role};
use scout_sampling::SamplerConfig;
use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// Token usage statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl From<&GenerationResult> for Usage {
    fn from(result: &GenerationResult) -> Self {
        Self {
            prompt_tokens: result.prompt_tokens,
            completion_tokens: result.generated_tokens,
            total_tokens: result.consumed_tokens(),
        }
    }
}

/// Chat message in OpenAI shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant.as_str().to_string(),
            content: content.into(),
        }
    }

    pub fn to_message(&self) -> Result<Message, ServerError> {
        let role = Role::from_str(&self.role).map_err(ServerError::InvalidRequest)?;
        Ok(Message::new(role, self.content.clone()))
    }
}

/// `stop` may be a single string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum StopSpec {
    One(String),
    Many(Vec<String>),
}

impl StopSpec {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StopSpec::One(s) => vec![s],
            StopSpec::Many(v) => v,
        }
    }
}

/// Per-request sampling overrides applied on top of a default
/// [`SamplerConfig`]. Field names follow the OpenAI request body.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SamplerOverrides {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<usize>,
    pub max_tokens: Option<usize>,
    pub repetition_penalty: Option<f32>,
    pub stop: Option<StopSpec>,
    pub seed: Option<u64>,
}

impl SamplerOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// `base` with every present field replaced, validated.
    pub fn apply(&self, base: &SamplerConfig) -> Result<SamplerConfig, ServerError> {
        let mut config = base.clone();
        if let Some(t) = self.temperature {
            config.temperature = t;
        }
        if let Some(p) = self.top_p {
            config.top_p = p;
        }
        if let Some(k) = self.top_k {
            config.top_k = k;
        }
        if let Some(n) = self.max_tokens {
            config.max_new_tokens = n;
        }
        if let Some(penalty) = self.repetition_penalty {
            config.repetition_penalty = penalty;
        }
        if let Some(stop) = &self.stop {
            config.stop_sequences = stop.clone().into_vec();
        }
        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }
        config
            .validate()
            .map_err(|e| ServerError::InvalidRequest(e.to_string()))?;
        Ok(config)
    }
}

/// OpenAI `finish_reason` for a turn.
pub fn finish_reason(reason: FinishReason) -> String {
    reason.as_openai().to_string()
}
