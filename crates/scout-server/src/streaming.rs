//! Server-Sent Events (SSE) for turns.
//!
//! Both streams own the turn's [`Attachment`] and [`TurnGuard`]. When the
//! client disconnects, axum drops the stream, which cancels generation at
//! the next step and frees the turn slot.
//!
//! Session turns use named events:
//! - `event: fragment`, `id: <n>`, `data: {"text": ...}` for every fragment
//! - `event: done`, `data: <GenerationResult>` or `event: error`,
//!   `data: {"message": ...}` exactly once at the end
//!
//! Chat completions follow the OpenAI protocol: `data: {chunk}` per
//! fragment, then `data: [DONE]`.

use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::Utc;
use futures::stream::{Stream, StreamExt};
use scout_agents::{Attachment, StreamEvent};
use serde_json::json;
use uuid::Uuid;

use crate::models::common::finish_reason;
use crate::models::streaming::{ChatCompletionChunk, ChatDelta};
use crate::session_manager::TurnGuard;

/// SSE form of one gateway event.
pub fn session_event(event: &StreamEvent) -> Event {
    let sse = match event {
        StreamEvent::Fragment { index, text } => Event::default()
            .event("fragment")
            .id(index.to_string())
            .json_data(json!({ "text": text })),
        StreamEvent::Done { result } => Event::default().event("done").json_data(result),
        StreamEvent::Error { message } => Event::default()
            .event("error")
            .json_data(json!({ "message": message })),
    };
    // Serializing plain data to JSON cannot fail; keep the stream alive
    // with a bare error event if it somehow does.
    sse.unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

/// Stream a session turn.
pub fn stream_session_turn(
    attachment: Attachment,
    guard: TurnGuard,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        let _guard = guard;
        let mut events = Box::pin(attachment.into_stream());
        while let Some(event) = events.next().await {
            yield Ok(session_event(&event));
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn chunk_event(chunk: &ChatCompletionChunk) -> Event {
    Event::default()
        .json_data(chunk)
        .unwrap_or_else(|e| Event::default().data(e.to_string()))
}

/// Stream an OpenAI-style chat completion.
pub fn stream_chat_completion(
    attachment: Attachment,
    guard: TurnGuard,
    model: String,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let request_id = format!("chatcmpl-{}", Uuid::new_v4());
    let created = Utc::now().timestamp() as u64;

    let stream = async_stream::stream! {
        let _guard = guard;

        let role = ChatDelta {
            role: Some("assistant".to_string()),
            content: None,
        };
        yield Ok(chunk_event(&ChatCompletionChunk::new(&request_id, created, &model, role, None)));

        let mut events = Box::pin(attachment.into_stream());
        while let Some(event) = events.next().await {
            match event {
                StreamEvent::Fragment { text, .. } => {
                    let delta = ChatDelta {
                        role: None,
                        content: Some(text),
                    };
                    yield Ok(chunk_event(&ChatCompletionChunk::new(&request_id, created, &model, delta, None)));
                }
                StreamEvent::Done { result } => {
                    let finish = Some(finish_reason(result.finish_reason));
                    yield Ok(chunk_event(&ChatCompletionChunk::new(
                        &request_id,
                        created,
                        &model,
                        ChatDelta::default(),
                        finish,
                    )));
                }
                StreamEvent::Error { message } => {
                    tracing::warn!(%request_id, error = %message, "chat completion failed mid-stream");
                    yield Ok(Event::default().json_data(json!({
                        "error": { "message": message, "type": "server_error" }
                    })).unwrap_or_else(|e| Event::default().data(e.to_string())));
                }
            }
        }

        yield Ok(Event::default().data("[DONE]"));
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
