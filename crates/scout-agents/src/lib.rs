//! # scout-agents
//!
//! Conversation-level orchestration on top of `scout-runtime`.
//!
//! This crate provides:
//! - [`Session`]: an ordered, context-bounded conversation with trim-to-fit
//!   eviction and serde snapshots
//! - [`ScriptExecutor`]: the bounded "generate code, execute, feed back"
//!   loop, with a sandboxed [`PythonRunner`]
//! - [`StreamingGateway`]: relays a turn's fragments to an async consumer
//!   over a bounded channel, with cancellation

pub mod executor;
pub mod gateway;
pub mod runner;
pub mod script;
pub mod session;

pub use executor::{
    ExecutionReport, ExecutorConfig, ExecutorState, ScriptExecutionRecord, ScriptExecutor,
    ScriptOutcome,
};
pub use gateway::{Attachment, GatewayConfig, SharedSession, StreamEvent, StreamingGateway};
pub use runner::{PythonRunner, RunStatus, SandboxPolicy, ScriptRun, ScriptRunner};
pub use script::{coding_preamble, extract_script, strip_sentinel};
pub use session::{PartialPolicy, Session, Transcript};

use scout_engine::EngineError;
use scout_tokenizer::TokenizerError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("session has no messages to respond to")]
    EmptyHistory,
    #[error("session is already generating a turn")]
    Busy,
}

impl SessionError {
    pub fn is_context_overflow(&self) -> bool {
        matches!(self, SessionError::Engine(EngineError::ContextOverflow { .. }))
    }
}

impl From<TokenizerError> for SessionError {
    fn from(err: TokenizerError) -> Self {
        SessionError::Engine(err.into())
    }
}

/// Failures of the script runner itself, as opposed to the script.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("failed to start interpreter {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("script io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
