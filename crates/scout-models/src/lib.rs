//! # scout-models
//!
//! Model artifacts and the CPU forward pass.
//!
//! Provides:
//! - **GGUF**: memory-mapped reader for metadata, tensor directory and data,
//!   plus a writer for producing artifacts
//! - **Quantization**: `F32`, `F16`, `Q8_0`, `Q4_0`, `Q4_1` dequantization;
//!   every other ggml type is recognized and rejected by name
//! - **Llama**: RMSNorm, RoPE, grouped-query attention and SwiGLU over a
//!   [`scout_kv::SessionKVCache`], exposed as a
//!   [`scout_engine::ComputeBackend`]
//! - **Vocabulary**: a `VocabTokenizer` built from `tokenizer.ggml.*` metadata
//! - **Tiny model**: a seeded byte-vocabulary llama artifact for demos and tests

pub mod gguf;
pub mod layers;
pub mod llama;
pub mod mmap;
pub mod quant;
pub mod tiny;
pub mod vocab;

pub use gguf::{GgufFile, GgufHeader, GgufWriter, MetadataValue, TensorInfo};
pub use llama::{LlamaBackend, LlamaHyperParams, LlamaModel, ARCHITECTURE};
pub use quant::GgmlType;
pub use tiny::{tiny_model, write_tiny_model, TinyModelConfig};
pub use vocab::load_vocab;
