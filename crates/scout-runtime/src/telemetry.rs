//! Generation telemetry.
//!
//! An [`InferenceTimer`] rides along with every token stream. It reports to a
//! [`TelemetryHook`] at three points: the prompt has been processed, a token
//! was sampled, and the stream closed. Built-in hooks:
//! [`NoopTelemetry`] drops everything, [`LogTelemetry`] keeps recent
//! summaries in memory, and [`TracingTelemetry`] emits `tracing` events.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use scout_engine::{FinishReason, TokenId};
use serde::Serialize;
use tracing::{debug, info, trace};

/// How the prompt of one generation was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PromptReport {
    /// Tokens run through the forward pass.
    pub prefill_tokens: usize,
    /// Leading tokens already present in the working state.
    pub reused_tokens: usize,
    /// Time from stream creation to the first logits being ready.
    pub latency: Duration,
}

/// Summary of one finished generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceMetrics {
    pub model: String,
    pub prefill_tokens: usize,
    pub reused_tokens: usize,
    pub generated_tokens: usize,
    /// Zero when the stream closed before the prompt was processed.
    pub time_to_first_token: Duration,
    pub total: Duration,
    /// `None` when the stream ended on an error.
    pub finish_reason: Option<FinishReason>,
}

impl InferenceMetrics {
    /// Decode throughput. Prompt processing time is excluded.
    pub fn tokens_per_second(&self) -> f64 {
        let decode = self.total.saturating_sub(self.time_to_first_token);
        if self.generated_tokens == 0 || decode.is_zero() {
            return 0.0;
        }
        self.generated_tokens as f64 / decode.as_secs_f64()
    }

    /// Share of the prompt that skipped the forward pass.
    pub fn prefix_reuse(&self) -> f64 {
        let prompt = self.prefill_tokens + self.reused_tokens;
        if prompt == 0 {
            0.0
        } else {
            self.reused_tokens as f64 / prompt as f64
        }
    }
}

/// Receives telemetry events. Every method defaults to doing nothing.
pub trait TelemetryHook: Send + Sync {
    fn on_prompt_processed(&self, _model: &str, _report: &PromptReport) {}

    /// `index` counts generated tokens from 1.
    fn on_token(&self, _index: usize, _token: TokenId, _elapsed: Duration) {}

    fn on_finished(&self, _metrics: &InferenceMetrics) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Keeps the summaries of the most recent generations.
#[derive(Debug, Clone)]
pub struct LogTelemetry {
    reports: Arc<Mutex<VecDeque<InferenceMetrics>>>,
    keep: usize,
}

impl Default for LogTelemetry {
    fn default() -> Self {
        Self::with_capacity(16)
    }
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain at most `keep` summaries (at least one).
    pub fn with_capacity(keep: usize) -> Self {
        Self {
            reports: Arc::new(Mutex::new(VecDeque::new())),
            keep: keep.max(1),
        }
    }

    pub fn last_metrics(&self) -> Option<InferenceMetrics> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .back()
            .cloned()
    }

    /// Retained summaries, oldest first.
    pub fn history(&self) -> Vec<InferenceMetrics> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_finished(&self, metrics: &InferenceMetrics) {
        let mut reports = self.reports.lock().unwrap_or_else(PoisonError::into_inner);
        if reports.len() == self.keep {
            reports.pop_front();
        }
        reports.push_back(metrics.clone());
    }
}

/// Structured log lines: prompt processing at debug, per token at trace and
/// the summary at info.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetryHook for TracingTelemetry {
    fn on_prompt_processed(&self, model: &str, report: &PromptReport) {
        debug!(
            model,
            prefill_tokens = report.prefill_tokens,
            reused_tokens = report.reused_tokens,
            latency_ms = report.latency.as_millis() as u64,
            "prompt processed"
        );
    }

    fn on_token(&self, index: usize, token: TokenId, elapsed: Duration) {
        trace!(index, token, elapsed_ms = elapsed.as_millis() as u64, "token");
    }

    fn on_finished(&self, m: &InferenceMetrics) {
        let reason = m
            .finish_reason
            .map_or_else(|| "error".to_string(), |r| r.to_string());
        info!(
            model = %m.model,
            ttft_ms = m.time_to_first_token.as_millis() as u64,
            tokens_per_sec = m.tokens_per_second(),
            prefill_tokens = m.prefill_tokens,
            reused_tokens = m.reused_tokens,
            generated_tokens = m.generated_tokens,
            finish_reason = %reason,
            "generation complete"
        );
    }
}

/// Clock for one generation, owned by its token stream.
pub struct InferenceTimer {
    model: String,
    prefill_tokens: usize,
    reused_tokens: usize,
    started: Instant,
    first_logits: Option<Duration>,
    generated: usize,
    hook: Arc<dyn TelemetryHook>,
}

impl InferenceTimer {
    pub fn new(
        model: impl Into<String>,
        prefill_tokens: usize,
        reused_tokens: usize,
        hook: Arc<dyn TelemetryHook>,
    ) -> Self {
        Self {
            model: model.into(),
            prefill_tokens,
            reused_tokens,
            started: Instant::now(),
            first_logits: None,
            generated: 0,
            hook,
        }
    }

    /// The prompt is in the working state. Only the first call counts.
    pub fn prompt_processed(&mut self) {
        if self.first_logits.is_some() {
            return;
        }
        let latency = self.started.elapsed();
        self.first_logits = Some(latency);
        let report = PromptReport {
            prefill_tokens: self.prefill_tokens,
            reused_tokens: self.reused_tokens,
            latency,
        };
        self.hook.on_prompt_processed(&self.model, &report);
    }

    pub fn token_generated(&mut self, token: TokenId) {
        self.generated += 1;
        self.hook
            .on_token(self.generated, token, self.started.elapsed());
    }

    pub fn finish(self, finish_reason: Option<FinishReason>) -> InferenceMetrics {
        let metrics = InferenceMetrics {
            model: self.model,
            prefill_tokens: self.prefill_tokens,
            reused_tokens: self.reused_tokens,
            generated_tokens: self.generated,
            time_to_first_token: self.first_logits.unwrap_or_default(),
            total: self.started.elapsed(),
            finish_reason,
        };
        self.hook.on_finished(&metrics);
        metrics
    }
}
