//! OpenAI-compatible chat completions.
//!
//! Each request builds a throwaway [`Session`] from the request's messages,
//! so history trimming and template rendering are the same as for
//! server-held sessions.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use chrono::Utc;
use scout_agents::Session;
use scout_engine::Role;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    error::ServerError,
    models::common::finish_reason,
    models::{ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Usage},
    state::AppState,
    streaming,
};

/// Handle chat completion requests (streaming and non-streaming).
pub async fn handle_chat_completion(
    State(state): State<AppState>,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<axum::response::Response, ServerError> {
    let session = build_session(&state, &req)?;
    let guard = state.sessions.try_acquire_turn(None)?;

    if req.stream {
        let attachment = state
            .gateway
            .attach(Arc::new(Mutex::new(session)), None)?;
        return Ok(
            streaming::stream_chat_completion(attachment, guard, state.model_name.clone())
                .into_response(),
        );
    }

    let mut session = session;
    let result = tokio::task::spawn_blocking(move || session.generate_turn(None))
        .await
        .map_err(|e| ServerError::Internal(format!("turn worker failed: {e}")))??;
    drop(guard);

    Ok(Json(ChatCompletionResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4()),
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp() as u64,
        model: state.model_name.clone(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage::assistant(result.text.clone()),
            finish_reason: finish_reason(result.finish_reason),
        }],
        usage: Usage::from(&result),
    })
    .into_response())
}

fn build_session(state: &AppState, req: &ChatCompletionRequest) -> Result<Session, ServerError> {
    let mut messages = req
        .messages
        .iter()
        .map(ChatMessage::to_message)
        .collect::<Result<Vec<_>, _>>()?;
    if messages.is_empty() {
        return Err(ServerError::InvalidRequest("messages must not be empty".into()));
    }

    let system = if messages.first().is_some_and(|m| m.role == Role::System) {
        Some(messages.remove(0).text())
    } else {
        None
    };
    let sampler = req.sampling.apply(&state.config.sampler)?;
    let mut session = state.new_session(system, sampler)?;
    for message in messages {
        session.append(message)?;
    }
    if session.is_empty() {
        return Err(ServerError::InvalidRequest(
            "messages must contain a non-system message".into(),
        ));
    }
    Ok(session)
}
