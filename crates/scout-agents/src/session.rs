//! Conversation threads over a shared [`Model`].
//!
//! A [`Session`] keeps its messages together with their encoded token
//! sequences, so the rendered prompt is the concatenation of cached parts
//! and its length is known without re-encoding. The cumulative count never
//! exceeds the model's context capacity: appends and turns evict the oldest
//! non-system messages first, and a request that cannot fit even after
//! maximal eviction fails without touching the history.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use scout_engine::{EngineError, FinishReason, GenerationResult, Message, Role, TokenId};
use scout_runtime::{CancellationToken, Model};
use scout_sampling::SamplerConfig;
use scout_tokenizer::{ChatFormatter, ChatTemplate, SystemPreamble};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{Result, SessionError};

/// What happens to the text of a turn that was cancelled mid-stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialPolicy {
    /// Leave the history exactly as it was before the turn.
    #[default]
    Discard,
    /// Append whatever was generated as the assistant message.
    Retain,
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    tokens: Vec<TokenId>,
}

/// Serializable snapshot of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub sampler: SamplerConfig,
}

/// One conversation. Generation takes `&mut self`, so a session can never
/// have two turns in flight.
pub struct Session {
    id: Uuid,
    created_at: DateTime<Utc>,
    model: Model,
    formatter: ChatFormatter,
    system: Option<Message>,
    header: Vec<TokenId>,
    system_block: Vec<TokenId>,
    entries: VecDeque<Entry>,
    sampler: SamplerConfig,
    turn_timeout: Option<Duration>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("model", &self.model.info().name)
            .field("messages", &self.entries.len())
            .field("tokens", &self.token_count())
            .finish()
    }
}

impl Session {
    pub fn new(model: Model, template: ChatTemplate) -> Self {
        let formatter = ChatFormatter::new(model.codec().clone(), template);
        let header = formatter.encode_header();
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            model,
            formatter,
            system: None,
            header,
            system_block: Vec::new(),
            entries: VecDeque::new(),
            sampler: SamplerConfig::default(),
            turn_timeout: None,
        }
    }

    /// A session using the template detected from the model's vocabulary.
    pub fn with_detected_template(model: Model) -> Self {
        let template = ChatTemplate::detect(model.codec().as_ref());
        Self::new(model, template)
    }

    pub fn with_system(mut self, prompt: impl Into<String>) -> Result<Self> {
        self.set_system_prompt(Some(prompt.into()))?;
        Ok(self)
    }

    pub fn with_preamble(mut self, preamble: SystemPreamble) -> Result<Self> {
        self.set_preamble(preamble)?;
        Ok(self)
    }

    pub fn with_sampler(mut self, config: SamplerConfig) -> Result<Self> {
        self.set_sampler(config)?;
        Ok(self)
    }

    /// Give up on a turn that runs longer than `timeout`.
    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn formatter(&self) -> &ChatFormatter {
        &self.formatter
    }

    /// Default decoding parameters for turns without an override.
    pub fn sampler(&self) -> &SamplerConfig {
        &self.sampler
    }

    pub fn set_sampler(&mut self, config: SamplerConfig) -> Result<()> {
        config
            .validate()
            .map_err(|e| EngineError::Inference(e.to_string()))?;
        self.sampler = config;
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.model.context_capacity()
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system.as_ref().and_then(|m| match m.parts.first() {
            Some(scout_engine::ContentPart::Text { text }) => Some(text.as_str()),
            _ => None,
        })
    }

    /// Retained messages after the system message, oldest first.
    pub fn messages(&self) -> impl DoubleEndedIterator<Item = &Message> + ExactSizeIterator {
        self.entries.iter().map(|e| &e.message)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tokens charged against the context window by the retained history.
    pub fn token_count(&self) -> usize {
        self.fixed_tokens() + self.entries.iter().map(|e| e.tokens.len()).sum::<usize>()
    }

    pub fn remaining_tokens(&self) -> usize {
        self.capacity().saturating_sub(self.token_count())
    }

    fn fixed_tokens(&self) -> usize {
        self.header.len() + self.system_block.len()
    }

    /// Replace (or clear) the leading system message. It is never evicted;
    /// older messages make room for it instead.
    pub fn set_system_prompt(&mut self, prompt: Option<String>) -> Result<()> {
        let system = prompt.map(Message::system);
        let block = self.formatter.encode_system(system.as_ref())?;
        self.replace_system_block(block)?;
        self.system = system;
        Ok(())
    }

    /// Swap the system-preamble strategy, e.g. to inject a persona.
    pub fn set_preamble(&mut self, preamble: SystemPreamble) -> Result<()> {
        let formatter = self.formatter.clone().with_preamble(preamble);
        let block = formatter.encode_system(self.system.as_ref())?;
        self.replace_system_block(block)?;
        self.formatter = formatter;
        Ok(())
    }

    fn replace_system_block(&mut self, block: Vec<TokenId>) -> Result<()> {
        let fixed = self.header.len() + block.len();
        let capacity = self.capacity();
        if fixed > capacity {
            return Err(EngineError::ContextOverflow {
                required: fixed,
                capacity,
            }
            .into());
        }
        let history: usize = self.entries.iter().map(|e| e.tokens.len()).sum();
        let mut excess = (fixed + history).saturating_sub(capacity);
        let mut evict = 0;
        while excess > 0 {
            excess = excess.saturating_sub(self.entries[evict].tokens.len());
            evict += 1;
        }
        self.evict(evict);
        self.system_block = block;
        Ok(())
    }

    /// Append a message. A system message appended to an empty session
    /// becomes its leading system message; later ones stay in the history
    /// (e.g. execution feedback). Older messages are evicted if needed.
    pub fn append(&mut self, message: Message) -> Result<()> {
        if message.role == Role::System && self.system.is_none() && self.entries.is_empty() {
            return self.set_system_prompt(Some(message.text()));
        }
        let tokens = self.formatter.encode_message(&message)?;
        self.trim_to_fit(tokens.len())?;
        self.entries.push_back(Entry { message, tokens });
        Ok(())
    }

    /// Evict the oldest non-system messages until `required` more tokens
    /// fit. Returns how many were evicted.
    ///
    /// Fails with [`EngineError::ContextOverflow`], evicting nothing, when
    /// the system message plus `required` alone exceed the capacity.
    pub fn trim_to_fit(&mut self, required: usize) -> Result<usize> {
        let evict = self.plan_eviction(required)?;
        self.evict(evict);
        Ok(evict)
    }

    fn plan_eviction(&self, required: usize) -> Result<usize> {
        let capacity = self.capacity();
        let fixed = self.fixed_tokens();
        if fixed + required > capacity {
            return Err(EngineError::ContextOverflow {
                required: fixed + required,
                capacity,
            }
            .into());
        }
        let mut total = self.token_count();
        let mut evict = 0;
        while total + required > capacity {
            total -= self.entries[evict].tokens.len();
            evict += 1;
        }
        Ok(evict)
    }

    fn evict(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        let freed: usize = self.entries.drain(..count).map(|e| e.tokens.len()).sum();
        warn!(
            session_id = %self.id,
            evicted = count,
            freed_tokens = freed,
            remaining = self.entries.len(),
            "evicted oldest messages to fit context window"
        );
    }

    /// Drop the history, keeping the system message.
    pub fn reset(&mut self) {
        self.entries.clear();
        debug!(session_id = %self.id, "session reset");
    }

    /// The exact prompt the next turn would send to the model.
    pub fn prompt_tokens(&self) -> Result<Vec<TokenId>> {
        let generation_prompt = self.formatter.encode_generation_prompt()?;
        Ok(self.assemble(&generation_prompt))
    }

    fn assemble(&self, generation_prompt: &[TokenId]) -> Vec<TokenId> {
        let mut prompt = Vec::with_capacity(self.token_count() + generation_prompt.len());
        prompt.extend_from_slice(&self.header);
        prompt.extend_from_slice(&self.system_block);
        for entry in &self.entries {
            prompt.extend_from_slice(&entry.tokens);
        }
        prompt.extend_from_slice(generation_prompt);
        prompt
    }

    /// Generate an assistant turn with the session's default sampler (or
    /// `config`) and append it on success.
    pub fn generate_turn(&mut self, config: Option<&SamplerConfig>) -> Result<GenerationResult> {
        self.generate_turn_with(config, CancellationToken::new(), PartialPolicy::Discard, |_| {})
    }

    /// [`Session::generate_turn`] with cancellation, a partial-result
    /// policy and a callback receiving each decoded fragment in order.
    ///
    /// Room for the generation prompt plus `max_new_tokens` is reserved
    /// first. If that would evict the newest message (the request itself)
    /// the call fails with [`EngineError::ContextOverflow`] and the history
    /// is left untouched.
    pub fn generate_turn_with<F>(
        &mut self,
        config: Option<&SamplerConfig>,
        cancel: CancellationToken,
        policy: PartialPolicy,
        on_fragment: F,
    ) -> Result<GenerationResult>
    where
        F: FnMut(&str),
    {
        self.run_turn(config, cancel, policy, on_fragment)
            .map(|(result, _)| result)
    }

    /// Reply to the newest message, which the caller has just appended.
    pub fn reply(&mut self, config: Option<&SamplerConfig>) -> Result<GenerationResult> {
        self.reply_with(config, CancellationToken::new(), PartialPolicy::Discard, |_| {})
    }

    /// [`Session::generate_turn_with`] for a request the caller has just
    /// appended. If the turn fails, or its output is discarded, the request
    /// is taken back out so the history never ends on an unanswered message.
    pub fn reply_with<F>(
        &mut self,
        config: Option<&SamplerConfig>,
        cancel: CancellationToken,
        policy: PartialPolicy,
        on_fragment: F,
    ) -> Result<GenerationResult>
    where
        F: FnMut(&str),
    {
        let outcome = self.run_turn(config, cancel, policy, on_fragment);
        if !matches!(outcome, Ok((_, true))) {
            self.retract_newest();
        }
        outcome.map(|(result, _)| result)
    }

    fn retract_newest(&mut self) {
        if let Some(entry) = self.entries.pop_back() {
            debug!(
                session_id = %self.id,
                tokens = entry.tokens.len(),
                "unanswered message removed"
            );
        }
    }

    /// Runs one turn. The flag reports whether the reply was appended.
    fn run_turn<F>(
        &mut self,
        config: Option<&SamplerConfig>,
        cancel: CancellationToken,
        policy: PartialPolicy,
        mut on_fragment: F,
    ) -> Result<(GenerationResult, bool)>
    where
        F: FnMut(&str),
    {
        let config = config.unwrap_or(&self.sampler).clone();
        if self.entries.is_empty() {
            return Err(SessionError::EmptyHistory);
        }

        let generation_prompt = self.formatter.encode_generation_prompt()?;
        let reserve = generation_prompt.len() + config.max_new_tokens;
        let evict = self.plan_eviction(reserve)?;
        if evict >= self.entries.len() {
            let required = self.fixed_tokens()
                + self.entries.back().map_or(0, |e| e.tokens.len())
                + reserve;
            return Err(EngineError::ContextOverflow {
                required,
                capacity: self.capacity(),
            }
            .into());
        }
        self.evict(evict);

        let prompt = self.assemble(&generation_prompt);
        let stops = self.formatter.stop_sequences(&[]);
        let deadline = self.turn_timeout.map(|t| Instant::now() + t);
        let started = Instant::now();

        let mut stream = self
            .model
            .generate_text(&prompt, &config, &stops, cancel)?
            .with_deadline(deadline);
        while let Some(fragment) = stream.next() {
            match fragment {
                Ok(fragment) => on_fragment(&fragment),
                Err(EngineError::Timeout) => {
                    warn!(session_id = %self.id, "turn timed out; partial output discarded");
                    return Err(EngineError::Timeout.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
        let result = stream.result();
        drop(stream);

        let keep = match result.finish_reason {
            FinishReason::Cancelled => policy == PartialPolicy::Retain && !result.text.is_empty(),
            _ => true,
        };
        if keep {
            let message = Message::assistant(result.text.clone());
            let tokens = self.formatter.encode_message(&message)?;
            self.trim_to_fit(tokens.len())?;
            self.entries.push_back(Entry { message, tokens });
        }

        info!(
            session_id = %self.id,
            prompt_tokens = result.prompt_tokens,
            generated_tokens = result.generated_tokens,
            finish_reason = %result.finish_reason,
            elapsed_ms = started.elapsed().as_millis() as u64,
            appended = keep,
            "turn complete"
        );
        Ok((result, keep))
    }

    pub fn transcript(&self) -> Transcript {
        Transcript {
            id: self.id,
            created_at: self.created_at,
            system: self.system_prompt().map(str::to_string),
            messages: self.messages().cloned().collect(),
            sampler: self.sampler.clone(),
        }
    }

    /// Rebuild a session from a snapshot. Messages that no longer fit the
    /// model's window are evicted oldest first, as during a live session.
    pub fn restore(model: Model, template: ChatTemplate, transcript: Transcript) -> Result<Self> {
        let mut session = Self::new(model, template);
        session.id = transcript.id;
        session.created_at = transcript.created_at;
        session.set_sampler(transcript.sampler)?;
        session.set_system_prompt(transcript.system)?;
        for message in transcript.messages {
            session.append(message)?;
        }
        Ok(session)
    }
}
