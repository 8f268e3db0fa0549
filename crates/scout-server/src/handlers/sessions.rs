//! Server-held sessions.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use scout_agents::{Session, SessionError};
use tracing::info;
use uuid::Uuid;

use crate::{
    error::ServerError,
    models::{ChatMessage, CreateSessionRequest, PostMessageRequest, SessionInfo, TurnResponse},
    state::AppState,
    streaming,
};

fn describe(session: &Session, model: &str) -> SessionInfo {
    SessionInfo {
        id: session.id(),
        created_at: session.created_at(),
        model: model.to_string(),
        context_capacity: session.capacity(),
        token_count: session.token_count(),
        messages: session
            .messages()
            .map(|m| ChatMessage {
                role: m.role.as_str().to_string(),
                content: m.text(),
            })
            .collect(),
    }
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionInfo>), ServerError> {
    let sampler = req.sampling.apply(&state.config.sampler)?;
    let session = state.new_session(req.system, sampler)?;
    let body = describe(&session, &state.model_name);
    let id = state.sessions.insert(session).await?;
    info!(session_id = %id, "session created");
    Ok((StatusCode::CREATED, Json(body)))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionInfo>, ServerError> {
    let shared = state.sessions.get(id).await?;
    let session = shared.try_lock().map_err(|_| SessionError::Busy)?;
    Ok(Json(describe(&session, &state.model_name)))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ServerError> {
    state.sessions.remove(id).await?;
    info!(session_id = %id, "session deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Append a message and generate the assistant's reply, streamed as SSE
/// unless `stream` is false.
pub async fn post_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<PostMessageRequest>,
) -> Result<Response, ServerError> {
    let shared = state.sessions.get(id).await?;
    let message = ChatMessage {
        role: req.role,
        content: req.content,
    }
    .to_message()?;
    let guard = state.sessions.try_acquire_turn(Some(id))?;

    // One lock covers the append and the turn, so no other request can
    // slip in between them.
    let mut session = shared.try_lock_owned().map_err(|_| SessionError::Busy)?;
    let sampler = if req.sampling.is_empty() {
        None
    } else {
        Some(req.sampling.apply(session.sampler())?)
    };
    session.append(message)?;

    if req.stream {
        let attachment = state.gateway.attach_reply(session, sampler);
        return Ok(streaming::stream_session_turn(attachment, guard).into_response());
    }

    let result = tokio::task::spawn_blocking(move || session.reply(sampler.as_ref()))
        .await
        .map_err(|e| ServerError::Internal(format!("turn worker failed: {e}")))??;
    drop(guard);

    Ok(Json(TurnResponse {
        session_id: id,
        message: ChatMessage::assistant(result.text.clone()),
        result,
    })
    .into_response())
}
