//! A tiny seeded llama model with a byte-level vocabulary.
//!
//! The vocabulary assigns ids exactly like `ByteTokenizer::chatml()`: bytes
//! `0..256`, then `<s>`, `</s>`, `<|im_start|>`, `<|im_end|>`. The weights are
//! random, so output is gibberish, but every code path from artifact parsing
//! to sampling runs for real.

use std::path::Path;

use scout_engine::{LoadError, QuantizationTag};
use scout_tokenizer::vocab::byte_level_char;
use scout_tokenizer::TokenType;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::gguf::{GgufWriter, MetadataValue};
use crate::quant::{quantize, GgmlType, QK};

pub const TINY_SPECIALS: [&str; 4] = ["<s>", "</s>", "<|im_start|>", "<|im_end|>"];

/// Geometry of the generated model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TinyModelConfig {
    pub d_model: usize,
    pub d_ff: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub n_layers: usize,
    pub context_length: usize,
    pub seed: u64,
    /// Storage type for the 2-D weight tensors. Norms are always F32.
    pub quantization: QuantizationTag,
}

impl Default for TinyModelConfig {
    fn default() -> Self {
        Self {
            d_model: 32,
            d_ff: 64,
            n_heads: 4,
            n_kv_heads: 2,
            n_layers: 2,
            context_length: 256,
            seed: 42,
            quantization: QuantizationTag::F32,
        }
    }
}

impl TinyModelConfig {
    pub fn with_quantization(mut self, tag: QuantizationTag) -> Self {
        self.quantization = tag;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn vocab_size(&self) -> usize {
        256 + TINY_SPECIALS.len()
    }
}

/// xorshift64* stream of weights in `[-scale, scale)`.
struct WeightRng(u64);

impl WeightRng {
    fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).max(1))
    }

    fn next(&mut self, scale: f32) -> f32 {
        self.0 ^= self.0 >> 12;
        self.0 ^= self.0 << 25;
        self.0 ^= self.0 >> 27;
        let bits = self.0.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 40;
        (bits as f32 / (1u64 << 24) as f32 * 2.0 - 1.0) * scale
    }

    fn fill(&mut self, n: usize, scale: f32) -> Vec<f32> {
        (0..n).map(|_| self.next(scale)).collect()
    }
}

/// Build the artifact in memory.
pub fn tiny_model(config: &TinyModelConfig) -> Result<GgufWriter, LoadError> {
    let c = config;
    let head_dim = c.d_model / c.n_heads.max(1);
    let kv_dim = c.n_kv_heads * head_dim;
    let weight_type = GgmlType::from_tag(c.quantization);
    if weight_type != GgmlType::F32 && (c.d_model % QK != 0 || c.d_ff % QK != 0) {
        return Err(LoadError::Malformed(format!(
            "d_model and d_ff must be multiples of {QK} for {}",
            c.quantization
        )));
    }

    let mut w = GgufWriter::new();
    w.add_metadata("general.architecture", "llama");
    w.add_metadata("general.name", "scout-tiny");
    w.add_metadata("llama.embedding_length", c.d_model as u32);
    w.add_metadata("llama.feed_forward_length", c.d_ff as u32);
    w.add_metadata("llama.block_count", c.n_layers as u32);
    w.add_metadata("llama.attention.head_count", c.n_heads as u32);
    w.add_metadata("llama.attention.head_count_kv", c.n_kv_heads as u32);
    w.add_metadata("llama.context_length", c.context_length as u32);
    w.add_metadata("llama.rope.freq_base", 10_000.0f32);
    w.add_metadata("llama.attention.layer_norm_rms_epsilon", 1e-5f32);

    let mut tokens: Vec<String> = (0..=255u8).map(|b| byte_level_char(b).to_string()).collect();
    tokens.extend(TINY_SPECIALS.iter().map(|s| s.to_string()));
    let types = (0..c.vocab_size()).map(|i| {
        if i < 256 {
            TokenType::Normal.as_i32()
        } else {
            TokenType::Control.as_i32()
        }
    });
    w.add_metadata("tokenizer.ggml.model", "gpt2");
    w.add_metadata("tokenizer.ggml.tokens", MetadataValue::string_array(tokens));
    w.add_metadata("tokenizer.ggml.token_type", MetadataValue::i32_array(types));
    w.add_metadata("tokenizer.ggml.merges", MetadataValue::string_array(Vec::<String>::new()));
    w.add_metadata("tokenizer.ggml.bos_token_id", 256u32);
    w.add_metadata("tokenizer.ggml.eos_token_id", 257u32);

    let mut rng = WeightRng::new(c.seed);
    let mut matrix = |w: &mut GgufWriter, name: &str, rows: usize, cols: usize| -> Result<(), LoadError> {
        let values = rng.fill(rows * cols, 1.0 / (cols as f32).sqrt());
        let data = quantize(weight_type, &values)?;
        w.add_tensor(name, &[cols as u64, rows as u64], weight_type, data)
    };
    let norm = |w: &mut GgufWriter, name: &str, len: usize| -> Result<(), LoadError> {
        let data = quantize(GgmlType::F32, &vec![1.0; len])?;
        w.add_tensor(name, &[len as u64], GgmlType::F32, data)
    };

    matrix(&mut w, "token_embd.weight", c.vocab_size(), c.d_model)?;
    for i in 0..c.n_layers {
        let name = |t: &str| format!("blk.{i}.{t}.weight");
        norm(&mut w, &name("attn_norm"), c.d_model)?;
        matrix(&mut w, &name("attn_q"), c.d_model, c.d_model)?;
        matrix(&mut w, &name("attn_k"), kv_dim, c.d_model)?;
        matrix(&mut w, &name("attn_v"), kv_dim, c.d_model)?;
        matrix(&mut w, &name("attn_output"), c.d_model, c.d_model)?;
        norm(&mut w, &name("ffn_norm"), c.d_model)?;
        matrix(&mut w, &name("ffn_gate"), c.d_ff, c.d_model)?;
        matrix(&mut w, &name("ffn_up"), c.d_ff, c.d_model)?;
        matrix(&mut w, &name("ffn_down"), c.d_model, c.d_ff)?;
    }
    norm(&mut w, "output_norm.weight", c.d_model)?;
    Ok(w)
}

/// Write the tiny model to `path`.
pub fn write_tiny_model(path: &Path, config: &TinyModelConfig) -> Result<(), LoadError> {
    tiny_model(config)?.write_file(path)?;
    info!(path = %path.display(), quantization = %config.quantization, "wrote tiny model");
    Ok(())
}
