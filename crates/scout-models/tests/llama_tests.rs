//! End-to-end tests over generated GGUF artifacts.
//!
//! Validates:
//! - The tiny model parses, loads and tokenizes like the reference byte codec
//! - Forward passes are deterministic and prefix reuse matches fresh compute
//! - Quantized artifacts load through every supported block format
//! - Malformed and unsupported artifacts fail with the right `LoadError`

use std::path::PathBuf;

use scout_engine::{ComputeBackend, EngineError, LoadError, QuantizationTag};
use scout_models::*;
use scout_tokenizer::{ByteTokenizer, TokenCodec};
use tempfile::TempDir;

fn write(dir: &TempDir, name: &str, config: &TinyModelConfig) -> PathBuf {
    let path = dir.path().join(name);
    write_tiny_model(&path, config).unwrap();
    path
}

fn load(config: &TinyModelConfig) -> (TempDir, GgufFile, LlamaModel) {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "tiny.gguf", config);
    let file = GgufFile::open(&path).unwrap();
    let model = LlamaModel::load(&file).unwrap();
    (dir, file, model)
}

#[test]
fn tiny_model_hyperparameters() {
    let config = TinyModelConfig::default();
    let (_dir, file, model) = load(&config);
    let p = model.params();
    assert_eq!(p.d_model, 32);
    assert_eq!(p.n_heads, 4);
    assert_eq!(p.n_kv_heads, 2);
    assert_eq!(p.head_dim(), 8);
    assert_eq!(p.vocab_size, config.vocab_size());
    assert_eq!(p.context_length, 256);
    assert_eq!(file.header().get_str("general.name"), Some("scout-tiny"));
    assert_eq!(file.header().dominant_weight_type(), Some(GgmlType::F32));
}

#[test]
fn tiny_vocab_matches_byte_codec() {
    let (_dir, file, _model) = load(&TinyModelConfig::default());
    let vocab = load_vocab(file.header()).unwrap();
    let reference = ByteTokenizer::chatml();
    for text in ["hello world", "<|im_start|>user\nhi<|im_end|>", "日本語 🦀"] {
        assert_eq!(vocab.encode(text).unwrap(), reference.encode(text).unwrap());
        assert_eq!(vocab.decode(&vocab.encode(text).unwrap()).unwrap(), text);
    }
    assert_eq!(vocab.bos_token(), Some(256));
    assert_eq!(vocab.eos_token(), Some(257));
}

#[test]
fn forward_is_deterministic() {
    let (_dir, _file, model) = load(&TinyModelConfig::default());
    let mut a = model.backend(16).unwrap();
    let mut b = model.backend(16).unwrap();
    for token in [256, 72, 105] {
        let la = a.forward(token).unwrap();
        let lb = b.forward(token).unwrap();
        assert_eq!(la.len(), 260);
        assert!(la.iter().all(|v| v.is_finite()));
        assert_eq!(la, lb);
    }
    assert_eq!(a.cached_tokens(), &[256, 72, 105]);
}

#[test]
fn prefix_reuse_matches_fresh_compute() {
    let (_dir, _file, model) = load(&TinyModelConfig::default());

    let mut reused = model.backend(32).unwrap();
    for token in [256, 10, 20, 30, 40] {
        reused.forward(token).unwrap();
    }
    reused.truncate(3);
    assert_eq!(reused.cached_tokens(), &[256, 10, 20]);
    let reused_logits = reused.forward(99).unwrap();

    let mut fresh = model.backend(32).unwrap();
    let mut fresh_logits = Vec::new();
    for token in [256, 10, 20, 99] {
        fresh_logits = fresh.forward(token).unwrap();
    }
    assert_eq!(reused_logits, fresh_logits);
}

#[test]
fn full_context_overflows_without_dropping_history() {
    let (_dir, _file, model) = load(&TinyModelConfig::default());
    let mut backend = model.backend(3).unwrap();
    for token in [1, 2, 3] {
        backend.forward(token).unwrap();
    }
    let err = backend.forward(4).unwrap_err();
    assert!(matches!(
        err,
        EngineError::ContextOverflow { required: 4, capacity: 3 }
    ));
    assert_eq!(backend.cached_tokens(), &[1, 2, 3]);

    backend.reset();
    assert!(backend.cached_tokens().is_empty());
    backend.forward(1).unwrap();
}

#[test]
fn out_of_vocab_token_is_rejected() {
    let (_dir, _file, model) = load(&TinyModelConfig::default());
    let mut backend = model.backend(8).unwrap();
    assert!(matches!(backend.forward(5000), Err(EngineError::Inference(_))));
    assert!(backend.cached_tokens().is_empty());
}

#[test]
fn quantized_artifacts_load_and_run() {
    for tag in [
        QuantizationTag::F16,
        QuantizationTag::Q8_0,
        QuantizationTag::Q4_0,
        QuantizationTag::Q4_1,
    ] {
        let config = TinyModelConfig::default().with_quantization(tag);
        let (_dir, file, model) = load(&config);
        assert_eq!(
            file.header().dominant_weight_type(),
            Some(GgmlType::from_tag(tag))
        );
        let mut backend = model.backend(4).unwrap();
        let logits = backend.forward(256).unwrap();
        assert!(logits.iter().all(|v| v.is_finite()), "{tag}");
    }
}

#[test]
fn resident_estimate_counts_weights_and_cache() {
    let (_dir, file, model) = load(&TinyModelConfig::default());
    let p = model.params();
    let small = p.estimate_resident_bytes(file.header(), 16);
    let large = p.estimate_resident_bytes(file.header(), 32);
    // K and V, per layer, per kv head dimension, 4 bytes each.
    let per_token = (2 * p.n_layers * p.kv_dim() * 4) as u64;
    assert_eq!(large - small, 16 * per_token);
}

#[test]
fn other_architectures_are_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mamba.gguf");
    let mut writer = tiny_model(&TinyModelConfig::default()).unwrap();
    writer.add_metadata("general.architecture", "mamba");
    writer.write_file(&path).unwrap();

    let file = GgufFile::open(&path).unwrap();
    assert!(matches!(
        LlamaModel::load(&file),
        Err(LoadError::UnsupportedArchitecture(arch)) if arch == "mamba"
    ));
}

#[test]
fn truncated_artifact_is_malformed() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "tiny.gguf", &TinyModelConfig::default());
    let bytes = std::fs::read(&path).unwrap();
    let cut = dir.path().join("cut.gguf");
    std::fs::write(&cut, &bytes[..bytes.len() / 2]).unwrap();
    assert!(matches!(GgufFile::open(&cut), Err(LoadError::Malformed(_))));

    let garbage = dir.path().join("garbage.gguf");
    std::fs::write(&garbage, b"not a model at all").unwrap();
    assert!(matches!(GgufFile::open(&garbage), Err(LoadError::Malformed(_))));
}

#[test]
fn indivisible_head_count_is_malformed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("odd.gguf");
    let mut writer = tiny_model(&TinyModelConfig::default()).unwrap();
    // 32 does not split into 5 heads.
    writer.add_metadata("llama.attention.head_count", 5u32);
    writer.write_file(&path).unwrap();
    let file = GgufFile::open(&path).unwrap();
    assert!(matches!(LlamaModel::load(&file), Err(LoadError::Malformed(_))));
}
