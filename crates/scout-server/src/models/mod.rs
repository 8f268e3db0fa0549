//! Request and response bodies.

pub mod chat;
pub mod common;
pub mod sessions;
pub mod streaming;

pub use chat::{ChatChoice, ChatCompletionRequest, ChatCompletionResponse};
pub use common::{ChatMessage, SamplerOverrides, StopSpec, Usage};
pub use sessions::{CreateSessionRequest, PostMessageRequest, SessionInfo, TurnResponse};
pub use streaming::{ChatChoiceDelta, ChatCompletionChunk, ChatDelta};
