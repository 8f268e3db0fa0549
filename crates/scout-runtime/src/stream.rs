//! Step-wise generation over an exclusively leased backend.
//!
//! [`TokenStream`] yields sampled token ids one at a time and holds the
//! model's compute lease until it is dropped. [`TextStream`] layers
//! incremental UTF-8 decoding and stop-sequence scanning on top of it, so a
//! stop marker halts generation on the step that completes it.

use std::sync::{Arc, MutexGuard};
use std::time::Instant;

use scout_engine::{ComputeBackend, EngineError, FinishReason, GenerationResult, Result, TokenId};
use scout_sampling::Sampler;
use scout_tokenizer::{DecodingState, ScanOutcome, StopScanner, TokenCodec};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::telemetry::InferenceTimer;

/// Lazy, finite sequence of sampled tokens for one generation call.
///
/// The prompt is prefilled on the first call to `next`. Each later step
/// feeds the previously yielded token back into the backend before
/// sampling, so a consumer that stops pulling never pays for a forward pass
/// it did not need. Cancellation and the optional deadline are observed at
/// every step boundary, prefill steps included.
pub struct TokenStream<'a> {
    backend: MutexGuard<'a, Box<dyn ComputeBackend>>,
    sampler: Sampler,
    cancel: CancellationToken,
    /// Prompt followed by everything sampled so far.
    history: Vec<TokenId>,
    prompt_len: usize,
    reused: usize,
    prefilled: bool,
    pending: Option<TokenId>,
    logits: Vec<f32>,
    stop_tokens: Vec<TokenId>,
    max_new_tokens: usize,
    generated: usize,
    finish: Option<FinishReason>,
    done: bool,
    deadline: Option<Instant>,
    timer: Option<InferenceTimer>,
}

impl<'a> TokenStream<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        backend: MutexGuard<'a, Box<dyn ComputeBackend>>,
        sampler: Sampler,
        cancel: CancellationToken,
        prompt: Vec<TokenId>,
        reused: usize,
        stop_tokens: Vec<TokenId>,
        timer: InferenceTimer,
    ) -> Self {
        let max_new_tokens = sampler.config().max_new_tokens;
        Self {
            backend,
            sampler,
            cancel,
            prompt_len: prompt.len(),
            history: prompt,
            reused,
            prefilled: false,
            pending: None,
            logits: Vec::new(),
            stop_tokens,
            max_new_tokens,
            generated: 0,
            finish: None,
            done: false,
            deadline: None,
            timer: Some(timer),
        }
    }

    /// Why the stream ended; `None` while running or after an error.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish
    }

    pub fn prompt_tokens(&self) -> usize {
        self.prompt_len
    }

    pub fn generated_tokens(&self) -> usize {
        self.generated
    }

    /// Prompt tokens whose working state was reused from the previous call.
    pub fn reused_tokens(&self) -> usize {
        self.reused
    }

    pub fn is_finished(&self) -> bool {
        self.done
    }

    /// Sampled tokens, in order.
    pub fn generated(&self) -> &[TokenId] {
        &self.history[self.prompt_len..]
    }

    /// Fail with [`EngineError::Timeout`] at the first step boundary at or
    /// after `deadline`.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// End the stream early, e.g. when the caller saw a stop sequence.
    pub fn finish_with(&mut self, reason: FinishReason) {
        self.finish = Some(reason);
        self.close();
    }

    /// End the stream after a failure; no finish reason is recorded.
    pub(crate) fn abort(&mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.done = true;
        if let Some(timer) = self.timer.take() {
            timer.finish(self.finish);
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn check_deadline(&self) -> Result<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(EngineError::Timeout),
            _ => Ok(()),
        }
    }

    fn step(&mut self) -> Result<Option<TokenId>> {
        if self.cancelled() {
            self.finish = Some(FinishReason::Cancelled);
            return Ok(None);
        }
        self.check_deadline()?;

        if !self.prefilled {
            for i in self.reused..self.prompt_len {
                self.logits = self.backend.forward(self.history[i])?;
                if self.cancelled() {
                    self.finish = Some(FinishReason::Cancelled);
                    return Ok(None);
                }
                self.check_deadline()?;
            }
            self.prefilled = true;
            if let Some(timer) = self.timer.as_mut() {
                timer.prompt_processed();
            }
        }

        if self.generated >= self.max_new_tokens {
            self.finish = Some(FinishReason::MaxTokens);
            return Ok(None);
        }

        if let Some(token) = self.pending.take() {
            self.logits = self.backend.forward(token)?;
        }

        let token = self
            .sampler
            .select(&self.logits, &self.history)
            .map_err(|e| EngineError::Inference(e.to_string()))?;
        if self.stop_tokens.contains(&token) {
            self.finish = Some(FinishReason::EosToken);
            return Ok(None);
        }

        self.history.push(token);
        self.generated += 1;
        self.pending = Some(token);
        if let Some(timer) = self.timer.as_mut() {
            timer.token_generated(token);
        }
        Ok(Some(token))
    }
}

impl Iterator for TokenStream<'_> {
    type Item = Result<TokenId>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(token)) => Some(Ok(token)),
            Ok(None) => {
                debug!(
                    generated = self.generated,
                    finish_reason = ?self.finish,
                    "token stream finished"
                );
                self.close();
                None
            }
            Err(e) => {
                self.close();
                Some(Err(e))
            }
        }
    }
}

/// Decoded text fragments with incremental stop-sequence detection.
///
/// Fragments never split a UTF-8 character and never contain any part of a
/// stop sequence.
pub struct TextStream<'a> {
    tokens: TokenStream<'a>,
    codec: Arc<dyn TokenCodec>,
    decoder: DecodingState,
    scanner: StopScanner,
    text: String,
    finished: bool,
}

impl<'a> TextStream<'a> {
    pub(crate) fn new<S: AsRef<str>>(
        tokens: TokenStream<'a>,
        codec: Arc<dyn TokenCodec>,
        stop_sequences: &[S],
    ) -> Self {
        Self {
            tokens,
            codec,
            decoder: DecodingState::new(),
            scanner: StopScanner::new(stop_sequences),
            text: String::new(),
            finished: false,
        }
    }

    pub fn tokens(&self) -> &TokenStream<'a> {
        &self.tokens
    }

    /// See [`TokenStream::set_deadline`].
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.tokens.set_deadline(deadline);
        self
    }

    /// Text emitted so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Stop early and report the call as cancelled.
    pub fn cancel(&mut self) {
        self.tokens.finish_with(FinishReason::Cancelled);
        self.finished = true;
    }

    fn scan(&mut self, fragment: &str) -> String {
        match self.scanner.push(fragment) {
            ScanOutcome::Continue(text) => text,
            ScanOutcome::Stopped { emit, sequence } => {
                debug!(stop = %sequence, "stop sequence matched");
                self.tokens.finish_with(FinishReason::StopSequence);
                self.finished = true;
                emit
            }
        }
    }

    /// Flush decoder and scanner once the token stream has ended.
    fn drain(&mut self) -> String {
        self.finished = true;
        let tail = self.decoder.flush();
        let mut out = self.scan(&tail);
        if !self.scanner.is_stopped() {
            out.push_str(&self.scanner.finish());
        }
        out
    }

    /// Drive the stream to the end and summarize it.
    pub fn complete(mut self) -> Result<GenerationResult> {
        for fragment in self.by_ref() {
            fragment?;
        }
        Ok(self.result())
    }

    /// Summary of the stream so far. A stream dropped before it finished
    /// reports [`FinishReason::Cancelled`].
    pub fn result(&self) -> GenerationResult {
        GenerationResult {
            text: self.text.clone(),
            finish_reason: self.tokens.finish_reason().unwrap_or(FinishReason::Cancelled),
            prompt_tokens: self.tokens.prompt_tokens(),
            generated_tokens: self.tokens.generated_tokens(),
        }
    }
}

impl Iterator for TextStream<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let fragment = match self.tokens.next() {
                None => self.drain(),
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                Some(Ok(token)) => match self.codec.decode_token(token, &mut self.decoder) {
                    Ok(decoded) => self.scan(&decoded),
                    Err(e) => {
                        self.tokens.abort();
                        self.finished = true;
                        return Some(Err(e.into()));
                    }
                },
            };
            if !fragment.is_empty() {
                self.text.push_str(&fragment);
                return Some(Ok(fragment));
            }
        }
        None
    }
}
