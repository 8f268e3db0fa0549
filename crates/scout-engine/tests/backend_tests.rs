//! Integration tests for the scout-engine compute trait and shared types.
//!
//! Validates:
//! - ComputeBackend can be implemented by mock backends
//! - Trait objects work for dynamic dispatch (the "narrow waist" pattern)
//! - Working-state truncation and overflow reporting semantics

use scout_engine::*;

/// A backend whose logits always favour `(last_token + 1) % vocab`.
struct CountingBackend {
    vocab: usize,
    capacity: usize,
    tokens: Vec<TokenId>,
}

impl CountingBackend {
    fn new(vocab: usize, capacity: usize) -> Self {
        Self {
            vocab,
            capacity,
            tokens: Vec::new(),
        }
    }
}

impl ComputeBackend for CountingBackend {
    fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn context_capacity(&self) -> usize {
        self.capacity
    }

    fn cached_tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    fn truncate(&mut self, len: usize) {
        self.tokens.truncate(len);
    }

    fn forward(&mut self, token: TokenId) -> Result<Vec<f32>> {
        if self.tokens.len() >= self.capacity {
            return Err(EngineError::ContextOverflow {
                required: self.tokens.len() + 1,
                capacity: self.capacity,
            });
        }
        self.tokens.push(token);
        let mut logits = vec![0.0; self.vocab];
        logits[(token as usize + 1) % self.vocab] = 1.0;
        Ok(logits)
    }
}

#[test]
fn backend_as_trait_object() {
    let mut backend: Box<dyn ComputeBackend> = Box::new(CountingBackend::new(8, 16));
    let logits = backend.forward(3).unwrap();
    assert_eq!(logits.len(), backend.vocab_size());
    assert_eq!(logits[4], 1.0);
    assert_eq!(backend.cached_tokens(), &[3]);
}

#[test]
fn reset_defaults_to_full_truncation() {
    let mut backend = CountingBackend::new(8, 16);
    for t in 0..5 {
        backend.forward(t).unwrap();
    }
    backend.truncate(2);
    assert_eq!(backend.cached_tokens(), &[0, 1]);
    backend.reset();
    assert!(backend.cached_tokens().is_empty());
}

#[test]
fn full_working_state_reports_overflow_instead_of_evicting() {
    let mut backend = CountingBackend::new(4, 2);
    backend.forward(0).unwrap();
    backend.forward(1).unwrap();
    let err = backend.forward(2).unwrap_err();
    assert!(matches!(
        err,
        EngineError::ContextOverflow {
            required: 3,
            capacity: 2
        }
    ));
    // Nothing was dropped on our behalf.
    assert_eq!(backend.cached_tokens(), &[0, 1]);
}

#[test]
fn backends_are_send() {
    fn assert_send<T: Send>() {}
    assert_send::<Box<dyn ComputeBackend>>();
    assert_send::<CountingBackend>();
}

#[test]
fn model_info_is_cloneable_and_comparable() {
    let info = ModelInfo {
        name: "tiny".into(),
        architecture: "llama".into(),
        vocab_size: 260,
        context_capacity: 128,
        quantization: QuantizationTag::F32,
        bos_token: Some(256),
        stop_tokens: vec![257],
    };
    assert_eq!(info.clone(), info);
}
