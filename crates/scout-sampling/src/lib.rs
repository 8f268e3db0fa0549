//! # scout-sampling
//!
//! Sampling and decoding strategies for scout.
//!
//! The pipeline, applied once per generation step:
//! 1. Repetition penalty over the recent token window
//! 2. Temperature scaling + softmax (temperature 0 short-circuits to argmax)
//! 3. Top-k filtering
//! 4. Top-p (nucleus) filtering
//! 5. A draw from the renormalized distribution using an injected [`RandomSource`]
//!
//! Given the same logits, history, config and seed the selected token is
//! always the same.

use std::collections::HashSet;

use scout_engine::TokenId;
use serde::{Deserialize, Serialize};

/// Seed used when a config does not carry one.
pub const DEFAULT_SEED: u64 = 42;

/// Sampling error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SamplingError {
    #[error("invalid logits: {0}")]
    InvalidLogits(String),
    #[error("invalid sampler config: {0}")]
    InvalidConfig(String),
    #[error("no valid tokens after filtering")]
    NoValidTokens,
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Source of uniform random numbers for the final draw.
///
/// Injected by the caller so generation is reproducible under a fixed seed.
pub trait RandomSource {
    /// Next float in `[0, 1)`.
    fn next_f32(&mut self) -> f32;
}

impl<R: RandomSource + ?Sized> RandomSource for &mut R {
    fn next_f32(&mut self) -> f32 {
        (**self).next_f32()
    }
}

/// Deterministic RNG for reproducible sampling.
///
/// Uses a simple xorshift64 algorithm for fast, reproducible random numbers.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        // Avoid zero state which would produce all zeros
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }
}

impl Default for SeededRng {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

impl RandomSource for SeededRng {
    fn next_f32(&mut self) -> f32 {
        // xorshift64
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// Decoding parameters for one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Softmax temperature. 0.0 selects the arg-max deterministically.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Keep only the k most likely tokens. 0 = disabled.
    #[serde(default)]
    pub top_k: usize,

    /// Nucleus threshold in `[0, 1]`. 1.0 = disabled.
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Penalty >= 1.0 applied to tokens in the recent window. 1.0 = none.
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,

    /// How many trailing tokens count as "recent" for the penalty.
    #[serde(default = "default_repetition_window")]
    pub repetition_window: usize,

    /// Upper bound on tokens produced by one call.
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    /// Text that ends generation as soon as it appears in the output.
    #[serde(default)]
    pub stop_sequences: Vec<String>,

    /// Seed for the default random source.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}
fn default_repetition_penalty() -> f32 {
    1.0
}
fn default_repetition_window() -> usize {
    64
}
fn default_max_new_tokens() -> usize {
    512
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_k: 0,
            top_p: default_top_p(),
            repetition_penalty: default_repetition_penalty(),
            repetition_window: default_repetition_window(),
            max_new_tokens: default_max_new_tokens(),
            stop_sequences: Vec::new(),
            seed: None,
        }
    }
}

impl SamplerConfig {
    /// Deterministic arg-max decoding.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            ..Self::default()
        }
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.top_p = p;
        self
    }

    pub fn with_repetition_penalty(mut self, penalty: f32) -> Self {
        self.repetition_penalty = penalty;
        self
    }

    pub fn with_max_new_tokens(mut self, n: usize) -> Self {
        self.max_new_tokens = n;
        self
    }

    pub fn with_stop_sequence(mut self, stop: impl Into<String>) -> Self {
        self.stop_sequences.push(stop.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Check value ranges.
    pub fn validate(&self) -> SamplingResult<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(SamplingError::InvalidConfig(format!(
                "temperature must be >= 0 (got {})",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(SamplingError::InvalidConfig(format!(
                "top_p must be within [0, 1] (got {})",
                self.top_p
            )));
        }
        if !self.repetition_penalty.is_finite() || self.repetition_penalty < 1.0 {
            return Err(SamplingError::InvalidConfig(format!(
                "repetition_penalty must be >= 1.0 (got {})",
                self.repetition_penalty
            )));
        }
        if self.max_new_tokens == 0 {
            return Err(SamplingError::InvalidConfig(
                "max_new_tokens must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// The random source this config asks for.
    pub fn rng(&self) -> SeededRng {
        SeededRng::new(self.seed.unwrap_or(DEFAULT_SEED))
    }
}

/// A config bound to a random source, advanced on every call.
#[derive(Debug, Clone)]
pub struct Sampler<R: RandomSource = SeededRng> {
    config: SamplerConfig,
    rng: R,
}

impl Sampler<SeededRng> {
    /// Sampler seeded from `config.seed` (or [`DEFAULT_SEED`]).
    pub fn new(config: SamplerConfig) -> Self {
        let rng = config.rng();
        Self { config, rng }
    }
}

impl<R: RandomSource> Sampler<R> {
    pub fn with_rng(config: SamplerConfig, rng: R) -> Self {
        Self { config, rng }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Select the next token. `history` is the token sequence so far
    /// (prompt and output); only its trailing window is penalized.
    pub fn select(&mut self, logits: &[f32], history: &[TokenId]) -> SamplingResult<TokenId> {
        select(logits, history, &self.config, &mut self.rng)
    }
}

/// Run the full pipeline over one logits vector.
pub fn select(
    logits: &[f32],
    history: &[TokenId],
    config: &SamplerConfig,
    rng: &mut dyn RandomSource,
) -> SamplingResult<TokenId> {
    if logits.is_empty() {
        return Err(SamplingError::InvalidLogits("empty logits".to_string()));
    }
    if logits.iter().any(|l| l.is_nan()) {
        return Err(SamplingError::InvalidLogits("NaN in logits".to_string()));
    }

    let mut work = logits.to_vec();
    if config.repetition_penalty > 1.0 {
        let start = history.len().saturating_sub(config.repetition_window);
        apply_repetition_penalty(&mut work, &history[start..], config.repetition_penalty);
    }

    if config.temperature == 0.0 {
        return Ok(argmax(&work));
    }

    for logit in &mut work {
        *logit /= config.temperature;
    }
    let probs = softmax(&work);

    let mut candidates = sorted_candidates(&probs);
    if config.top_k > 0 {
        candidates.truncate(config.top_k);
    }
    renormalize(&mut candidates);
    if config.top_p < 1.0 {
        apply_top_p(&mut candidates, config.top_p);
        renormalize(&mut candidates);
    }

    draw(&candidates, rng)
}

/// Make every token present in `recent` less likely, regardless of sign:
/// positive logits are divided by the penalty, negative ones multiplied.
/// Each distinct token is penalized once.
fn apply_repetition_penalty(logits: &mut [f32], recent: &[TokenId], penalty: f32) {
    let mut seen = HashSet::new();
    for &token in recent {
        let idx = token as usize;
        if idx >= logits.len() || !seen.insert(token) {
            continue;
        }
        if logits[idx] > 0.0 {
            logits[idx] /= penalty;
        } else {
            logits[idx] *= penalty;
        }
    }
}

/// Highest score; ties resolve to the lowest token id.
fn argmax(scores: &[f32]) -> TokenId {
    let mut best = 0usize;
    for (i, &score) in scores.iter().enumerate().skip(1) {
        if score > scores[best] {
            best = i;
        }
    }
    best as TokenId
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max_logit == f32::NEG_INFINITY {
        return vec![1.0 / logits.len() as f32; logits.len()];
    }
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();

    if sum > 0.0 {
        exps.iter().map(|&e| e / sum).collect()
    } else {
        vec![1.0 / logits.len() as f32; logits.len()]
    }
}

/// Tokens with non-zero probability, most likely first, ties by id.
fn sorted_candidates(probs: &[f32]) -> Vec<(TokenId, f32)> {
    let mut candidates: Vec<(TokenId, f32)> = probs
        .iter()
        .enumerate()
        .filter(|(_, &p)| p > 0.0)
        .map(|(i, &p)| (i as TokenId, p))
        .collect();
    candidates.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    candidates
}

/// Keep the smallest prefix whose cumulative probability reaches `p`.
fn apply_top_p(candidates: &mut Vec<(TokenId, f32)>, p: f32) {
    let mut cumsum = 0.0;
    let mut keep = candidates.len();
    for (idx, (_, prob)) in candidates.iter().enumerate() {
        cumsum += prob;
        if cumsum >= p {
            keep = idx + 1;
            break;
        }
    }
    candidates.truncate(keep.max(1));
}

fn renormalize(candidates: &mut [(TokenId, f32)]) {
    let sum: f32 = candidates.iter().map(|(_, p)| p).sum();
    if sum > 0.0 {
        for (_, p) in candidates.iter_mut() {
            *p /= sum;
        }
    }
}

fn draw(candidates: &[(TokenId, f32)], rng: &mut dyn RandomSource) -> SamplingResult<TokenId> {
    let r = rng.next_f32();
    let mut cumsum = 0.0;
    for &(token, prob) in candidates {
        cumsum += prob;
        if r < cumsum {
            return Ok(token);
        }
    }
    // Rounding left r above the final cumulative sum.
    candidates
        .last()
        .map(|&(token, _)| token)
        .ok_or(SamplingError::NoValidTokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_rng_reproducible() {
        let mut rng1 = SeededRng::new(42);
        let mut rng2 = SeededRng::new(42);

        for _ in 0..100 {
            let v1 = rng1.next_f32();
            let v2 = rng2.next_f32();
            assert!((v1 - v2).abs() < 1e-6);
            assert!((0.0..1.0).contains(&v1));
        }
    }

    #[test]
    fn zero_seed_is_not_degenerate() {
        let mut rng = SeededRng::new(0);
        let a = rng.next_f32();
        let b = rng.next_f32();
        assert_ne!(a, b);
    }

    #[test]
    fn argmax_ties_pick_lowest_id() {
        assert_eq!(argmax(&[1.0, 5.0, 5.0, 2.0]), 1);
        assert_eq!(argmax(&[3.0, 3.0, 3.0]), 0);
    }

    #[test]
    fn softmax_uniform() {
        let probs = softmax(&[1.0, 1.0, 1.0]);
        assert!((probs[0] - 1.0 / 3.0).abs() < 1e-5);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn softmax_all_negative_infinity_is_uniform() {
        let probs = softmax(&[f32::NEG_INFINITY; 4]);
        assert!(probs.iter().all(|&p| (p - 0.25).abs() < 1e-6));
    }

    #[test]
    fn top_p_keeps_smallest_covering_prefix() {
        let mut candidates = vec![(0, 0.5), (1, 0.3), (2, 0.15), (3, 0.05)];
        apply_top_p(&mut candidates, 0.8);
        assert_eq!(candidates.iter().map(|c| c.0).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn top_p_zero_keeps_the_best_token() {
        let mut candidates = vec![(7, 0.6), (2, 0.4)];
        apply_top_p(&mut candidates, 0.0);
        assert_eq!(candidates, vec![(7, 0.6)]);
    }

    #[test]
    fn repetition_penalty_divides_positive_and_multiplies_negative() {
        let mut logits = vec![2.0, -2.0, 4.0];
        apply_repetition_penalty(&mut logits, &[0, 1, 0, 1], 2.0);
        assert_eq!(logits, vec![1.0, -4.0, 4.0]);
    }

    #[test]
    fn repetition_penalty_ignores_out_of_range_tokens() {
        let mut logits = vec![1.0, 1.0];
        apply_repetition_penalty(&mut logits, &[99], 2.0);
        assert_eq!(logits, vec![1.0, 1.0]);
    }

    #[test]
    fn sorted_candidates_break_ties_by_id() {
        let candidates = sorted_candidates(&[0.25, 0.25, 0.5, 0.0]);
        assert_eq!(
            candidates.iter().map(|c| c.0).collect::<Vec<_>>(),
            vec![2, 0, 1]
        );
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        assert!(SamplerConfig::default().validate().is_ok());
        assert!(SamplerConfig::default().with_temperature(-0.1).validate().is_err());
        assert!(SamplerConfig::default().with_top_p(1.5).validate().is_err());
        assert!(SamplerConfig::default()
            .with_repetition_penalty(0.5)
            .validate()
            .is_err());
        assert!(SamplerConfig::default().with_max_new_tokens(0).validate().is_err());
    }

    #[test]
    fn empty_logits() {
        let mut sampler = Sampler::new(SamplerConfig::default());
        assert!(matches!(
            sampler.select(&[], &[]),
            Err(SamplingError::InvalidLogits(_))
        ));
    }

    #[test]
    fn nan_logits_rejected() {
        let mut sampler = Sampler::new(SamplerConfig::greedy());
        assert!(sampler.select(&[1.0, f32::NAN], &[]).is_err());
    }
}
