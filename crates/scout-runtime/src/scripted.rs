//! A backend that replays canned replies.
//!
//! Used for deterministic tests and demos of everything above the compute
//! layer: sessions, the script executor and streaming surfaces.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use scout_engine::{ComputeBackend, EngineError, ModelInfo, QuantizationTag, Result, TokenId};
use scout_tokenizer::{ByteTokenizer, TokenCodec, TokenizerResult};

use crate::Model;

/// Logits strongly favour the next token of the current reply.
///
/// The position inside the reply is recovered from the working state: it is
/// the longest reply prefix the cached tokens end with. Once a reply has
/// been emitted in full the backend points at the stop token; the next
/// generation call (which always begins with a truncate) moves on to the
/// following reply. The last reply repeats forever. Replies must not start
/// with the final token of the prompt.
pub struct ScriptedBackend {
    replies: Vec<Vec<TokenId>>,
    current: usize,
    reply_done: bool,
    stop_token: TokenId,
    vocab_size: usize,
    capacity: usize,
    tokens: Vec<TokenId>,
    step_delay: Option<Duration>,
    forwards: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new<S: AsRef<str>>(
        codec: &dyn TokenCodec,
        replies: &[S],
        capacity: usize,
    ) -> TokenizerResult<Self> {
        let stop_token = codec
            .eos_token()
            .or_else(|| codec.stop_tokens().first().copied())
            .unwrap_or(0);
        let replies = replies
            .iter()
            .map(|r| codec.encode(r.as_ref()))
            .collect::<TokenizerResult<Vec<_>>>()?;
        Ok(Self {
            replies,
            current: 0,
            reply_done: false,
            stop_token,
            vocab_size: codec.vocab_size(),
            capacity,
            tokens: Vec::new(),
            step_delay: None,
            forwards: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Sleep this long in every forward pass.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    /// Shared counter of forward passes.
    pub fn forward_counter(&self) -> Arc<AtomicUsize> {
        self.forwards.clone()
    }

    fn progress(&self, reply: &[TokenId]) -> usize {
        (1..=reply.len().min(self.tokens.len()))
            .rev()
            .find(|&j| self.tokens.ends_with(&reply[..j]))
            .unwrap_or(0)
    }

    fn next_token(&mut self) -> TokenId {
        let Some(reply) = self.replies.get(self.current) else {
            return self.stop_token;
        };
        let done = self.progress(reply);
        if done < reply.len() {
            return reply[done];
        }
        self.reply_done = true;
        self.stop_token
    }
}

impl ComputeBackend for ScriptedBackend {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn context_capacity(&self) -> usize {
        self.capacity
    }

    fn cached_tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    fn truncate(&mut self, len: usize) {
        if self.reply_done && self.current + 1 < self.replies.len() {
            self.current += 1;
        }
        self.reply_done = false;
        self.tokens.truncate(len);
    }

    fn forward(&mut self, token: TokenId) -> Result<Vec<f32>> {
        if self.tokens.len() >= self.capacity {
            return Err(EngineError::ContextOverflow {
                required: self.tokens.len() + 1,
                capacity: self.capacity,
            });
        }
        if let Some(delay) = self.step_delay {
            std::thread::sleep(delay);
        }
        self.forwards.fetch_add(1, Ordering::Relaxed);
        self.tokens.push(token);

        let mut logits = vec![0.0; self.vocab_size];
        let next = self.next_token() as usize;
        if next < logits.len() {
            logits[next] = 100.0;
        }
        Ok(logits)
    }
}

impl Model {
    /// A model over [`ByteTokenizer::chatml`] that answers with `replies`.
    pub fn scripted<S: AsRef<str>>(replies: &[S], capacity: usize) -> Result<Self> {
        Self::scripted_with(replies, capacity, |b| b)
    }

    /// Like [`Model::scripted`], with a hook to adjust the backend.
    pub fn scripted_with<S, F>(replies: &[S], capacity: usize, adjust: F) -> Result<Self>
    where
        S: AsRef<str>,
        F: FnOnce(ScriptedBackend) -> ScriptedBackend,
    {
        let codec = ByteTokenizer::chatml();
        let backend = adjust(ScriptedBackend::new(&codec, replies, capacity)?);
        let info = ModelInfo {
            name: "scripted".into(),
            architecture: "scripted".into(),
            vocab_size: codec.vocab_size(),
            context_capacity: capacity,
            quantization: QuantizationTag::F32,
            bos_token: codec.bos_token(),
            stop_tokens: codec.stop_tokens(),
        };
        Ok(Model::from_parts(info, Arc::new(codec), Box::new(backend)))
    }
}
