//! # scout-engine
//!
//! The "narrow waist" of the scout stack. Defines the [`ComputeBackend`] trait
//! and the types every other crate speaks: token ids, chat messages, load
//! configuration, generation results and the error taxonomy.
//!
//! ## Design Notes
//!
//! ### Exclusive working state
//! `ComputeBackend` methods take `&mut self`. A backend owns the model's
//! attention working state, so exactly one generation may drive it at a time.
//! The runtime wraps each backend in a mutex and hands out a lease per
//! generation call; sessions never touch a backend directly.
//!
//! ### Token Type
//! `TokenId` is a `u32`: GGUF vocabularies are indexed by array position and
//! never exceed `u32::MAX` entries.

pub mod config;
pub mod message;

pub use config::{LoadConfig, QuantizationTag};
pub use message::{ContentPart, Message, Role};

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, EngineError>;

/// Token ID type.
pub type TokenId = u32;

/// Failure while loading a model artifact. Fatal for startup.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read model artifact {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed model artifact: {0}")]
    Malformed(String),
    #[error("unsupported quantization: {0}")]
    UnsupportedQuantization(String),
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),
    #[error("quantization mismatch: configured {expected}, artifact is {found}")]
    QuantizationMismatch {
        expected: QuantizationTag,
        found: QuantizationTag,
    },
    #[error("insufficient memory: model needs {required} bytes, limit is {available}")]
    InsufficientMemory { required: u64, available: u64 },
}

/// Top-level error type for generation-time operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("context overflow: {required} tokens required, capacity is {capacity}")]
    ContextOverflow { required: usize, capacity: usize },
    #[error("generation cancelled")]
    Cancelled,
    #[error("generation timed out")]
    Timeout,
    #[error("tokenization failed: {0}")]
    Tokenization(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("compute resource unavailable: {0}")]
    Busy(String),
}

/// Why a generation call stopped producing tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// A configured stop sequence (or template role marker) appeared.
    StopSequence,
    /// `max_new_tokens` were produced.
    MaxTokens,
    /// The model emitted an end-of-sequence token.
    EosToken,
    /// The consumer or caller cancelled the call.
    Cancelled,
}

impl FinishReason {
    /// OpenAI-style finish reason string.
    pub fn as_openai(&self) -> &'static str {
        match self {
            FinishReason::StopSequence | FinishReason::EosToken => "stop",
            FinishReason::MaxTokens => "length",
            FinishReason::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FinishReason::StopSequence => "stop-sequence",
            FinishReason::MaxTokens => "max-tokens",
            FinishReason::EosToken => "eos-token",
            FinishReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Outcome of one completed (or cancelled) generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Generated text, with any matched stop sequence removed.
    pub text: String,
    pub finish_reason: FinishReason,
    /// Tokens in the rendered prompt.
    pub prompt_tokens: usize,
    /// Tokens sampled during this call.
    pub generated_tokens: usize,
}

impl GenerationResult {
    /// Prompt plus generated tokens charged against the context window.
    pub fn consumed_tokens(&self) -> usize {
        self.prompt_tokens + self.generated_tokens
    }
}

/// Immutable facts about a loaded model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub architecture: String,
    pub vocab_size: usize,
    /// Effective context window: the smaller of the configured and trained length.
    pub context_capacity: usize,
    pub quantization: QuantizationTag,
    pub bos_token: Option<TokenId>,
    /// Tokens that terminate generation with [`FinishReason::EosToken`].
    pub stop_tokens: Vec<TokenId>,
}

/// The core compute trait. A backend owns weights plus the working state
/// (key/value cache) for one active token sequence.
///
/// `forward` appends a token to the working state and returns logits over
/// the full vocabulary for the next position. Backends never drop history on
/// their own: when the working state is full, `forward` fails with
/// [`EngineError::ContextOverflow`] and the caller decides what to evict.
pub trait ComputeBackend: Send {
    /// Vocabulary size; every logits vector has exactly this length.
    fn vocab_size(&self) -> usize;

    /// Maximum number of tokens the working state can hold.
    fn context_capacity(&self) -> usize;

    /// Tokens currently held in the working state, in order.
    fn cached_tokens(&self) -> &[TokenId];

    /// Discard working state beyond the first `len` tokens.
    fn truncate(&mut self, len: usize);

    /// Feed one token and return the logits for the following position.
    fn forward(&mut self, token: TokenId) -> Result<Vec<f32>>;

    /// Clear the working state entirely.
    fn reset(&mut self) {
        self.truncate(0);
    }
}
