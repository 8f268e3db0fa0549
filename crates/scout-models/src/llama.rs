//! llama-architecture CPU forward pass over a GGUF artifact.
//!
//! Weights are dequantized to `f32` once at load time and shared between
//! backends through an `Arc`. Each [`LlamaBackend`] owns its own KV cache.

use std::sync::Arc;

use scout_engine::{ComputeBackend, EngineError, LoadError, TokenId};
use scout_kv::{KVError, SessionKVCache};
use tracing::{debug, info};

use crate::gguf::{GgufFile, GgufHeader};
use crate::layers::{attention, swiglu, Matrix, RmsNorm, Rope};
use crate::quant::dequantize;

pub const ARCHITECTURE: &str = "llama";

/// Model hyperparameters read from `llama.*` metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct LlamaHyperParams {
    pub d_model: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    /// Key/value heads; fewer than `n_heads` means grouped-query attention.
    pub n_kv_heads: usize,
    pub d_ff: usize,
    pub vocab_size: usize,
    /// Trained context length.
    pub context_length: usize,
    pub rope_base: f32,
    pub norm_eps: f32,
}

impl LlamaHyperParams {
    pub fn from_header(header: &GgufHeader) -> Result<Self, LoadError> {
        let arch = header
            .get_str("general.architecture")
            .ok_or_else(|| LoadError::Malformed("missing general.architecture".into()))?;
        if arch != ARCHITECTURE {
            return Err(LoadError::UnsupportedArchitecture(arch.to_string()));
        }

        let key = |k: &str| format!("{ARCHITECTURE}.{k}");
        let get = |k: &str| header.require_u64(&key(k)).map(|v| v as usize);

        let n_heads = get("attention.head_count")?;
        let n_kv_heads = header
            .get_u64(&key("attention.head_count_kv"))
            .map_or(n_heads, |v| v as usize);
        let embd = header
            .tensor("token_embd.weight")
            .ok_or_else(|| LoadError::Malformed("missing tensor token_embd.weight".into()))?;
        let vocab_size = embd.dims.get(1).copied().unwrap_or(0) as usize;

        let params = Self {
            d_model: get("embedding_length")?,
            n_layers: get("block_count")?,
            n_heads,
            n_kv_heads,
            d_ff: get("feed_forward_length")?,
            vocab_size,
            context_length: get("context_length")?,
            rope_base: header.get_f32(&key("rope.freq_base")).unwrap_or(10_000.0),
            norm_eps: header
                .get_f32(&key("attention.layer_norm_rms_epsilon"))
                .unwrap_or(1e-5),
        };
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<(), LoadError> {
        let bad = |msg: String| Err(LoadError::Malformed(msg));
        if self.n_layers == 0 || self.d_model == 0 || self.d_ff == 0 || self.vocab_size == 0 {
            return bad(format!("degenerate hyperparameters: {self:?}"));
        }
        if self.n_heads == 0 || self.d_model % self.n_heads != 0 {
            return bad(format!(
                "embedding length {} not divisible into {} heads",
                self.d_model, self.n_heads
            ));
        }
        if self.head_dim() % 2 != 0 {
            return bad(format!("head dimension {} must be even", self.head_dim()));
        }
        if self.n_kv_heads == 0 || self.n_heads % self.n_kv_heads != 0 {
            return bad(format!(
                "{} heads cannot be grouped over {} kv heads",
                self.n_heads, self.n_kv_heads
            ));
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.n_heads
    }

    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim()
    }

    /// Bytes resident after load: every tensor dequantized to f32 plus a KV
    /// cache sized to `context`.
    pub fn estimate_resident_bytes(&self, header: &GgufHeader, context: usize) -> u64 {
        let weights = header
            .tensors
            .iter()
            .fold(0u64, |acc, t| acc.saturating_add(t.n_elements().saturating_mul(4)));
        weights.saturating_add(SessionKVCache::estimate_bytes(
            self.n_layers,
            context,
            self.n_kv_heads,
            self.head_dim(),
        ))
    }
}

#[derive(Debug)]
struct LayerWeights {
    attn_norm: RmsNorm,
    wq: Matrix,
    wk: Matrix,
    wv: Matrix,
    wo: Matrix,
    ffn_norm: RmsNorm,
    gate: Matrix,
    up: Matrix,
    down: Matrix,
}

#[derive(Debug)]
struct LlamaWeights {
    token_embd: Matrix,
    layers: Vec<LayerWeights>,
    output_norm: RmsNorm,
    /// `None` when the output projection is tied to the embeddings.
    output: Option<Matrix>,
}

impl LlamaWeights {
    fn output(&self) -> &Matrix {
        self.output.as_ref().unwrap_or(&self.token_embd)
    }
}

struct Loader<'a> {
    file: &'a GgufFile,
}

impl Loader<'_> {
    fn tensor(&self, name: &str, dims: &[u64]) -> Result<Vec<f32>, LoadError> {
        let info = self
            .file
            .header()
            .tensor(name)
            .ok_or_else(|| LoadError::Malformed(format!("missing tensor {name}")))?;
        if info.dims != dims {
            return Err(LoadError::Malformed(format!(
                "tensor {name} has dims {:?}, expected {dims:?}",
                info.dims
            )));
        }
        let data = self.file.tensor_data(info)?;
        dequantize(info.ggml_type, data, info.n_elements() as usize)
    }

    /// `[rows][cols]` matrix stored with GGUF dims `[cols, rows]`.
    fn matrix(&self, name: &str, rows: usize, cols: usize) -> Result<Matrix, LoadError> {
        let data = self.tensor(name, &[cols as u64, rows as u64])?;
        Ok(Matrix::new(rows, cols, data))
    }

    fn norm(&self, name: &str, len: usize, eps: f32) -> Result<RmsNorm, LoadError> {
        Ok(RmsNorm::new(self.tensor(name, &[len as u64])?, eps))
    }
}

/// Loaded weights and hyperparameters; hands out backends that share them.
#[derive(Debug, Clone)]
pub struct LlamaModel {
    params: LlamaHyperParams,
    weights: Arc<LlamaWeights>,
    rope: Rope,
}

impl LlamaModel {
    pub fn load(file: &GgufFile) -> Result<Self, LoadError> {
        let params = LlamaHyperParams::from_header(file.header())?;
        let p = &params;
        let l = Loader { file };

        let mut layers = Vec::with_capacity(p.n_layers);
        for i in 0..p.n_layers {
            let name = |t: &str| format!("blk.{i}.{t}.weight");
            layers.push(LayerWeights {
                attn_norm: l.norm(&name("attn_norm"), p.d_model, p.norm_eps)?,
                wq: l.matrix(&name("attn_q"), p.d_model, p.d_model)?,
                wk: l.matrix(&name("attn_k"), p.kv_dim(), p.d_model)?,
                wv: l.matrix(&name("attn_v"), p.kv_dim(), p.d_model)?,
                wo: l.matrix(&name("attn_output"), p.d_model, p.d_model)?,
                ffn_norm: l.norm(&name("ffn_norm"), p.d_model, p.norm_eps)?,
                gate: l.matrix(&name("ffn_gate"), p.d_ff, p.d_model)?,
                up: l.matrix(&name("ffn_up"), p.d_ff, p.d_model)?,
                down: l.matrix(&name("ffn_down"), p.d_model, p.d_ff)?,
            });
        }

        let output = match file.header().tensor("output.weight") {
            Some(_) => Some(l.matrix("output.weight", p.vocab_size, p.d_model)?),
            None => None,
        };
        let weights = LlamaWeights {
            token_embd: l.matrix("token_embd.weight", p.vocab_size, p.d_model)?,
            layers,
            output_norm: l.norm("output_norm.weight", p.d_model, p.norm_eps)?,
            output,
        };
        info!(
            layers = p.n_layers,
            d_model = p.d_model,
            heads = p.n_heads,
            kv_heads = p.n_kv_heads,
            vocab = p.vocab_size,
            tied_output = weights.output.is_none(),
            "loaded llama weights"
        );

        Ok(Self {
            rope: Rope::new(p.head_dim(), p.rope_base),
            params,
            weights: Arc::new(weights),
        })
    }

    pub fn params(&self) -> &LlamaHyperParams {
        &self.params
    }

    /// A backend with a KV cache holding up to `context_capacity` tokens.
    pub fn backend(&self, context_capacity: usize) -> Result<LlamaBackend, LoadError> {
        let p = &self.params;
        let cache = SessionKVCache::new(p.n_layers, context_capacity, p.n_kv_heads, p.head_dim())
            .map_err(|e| LoadError::Malformed(e.to_string()))?;
        Ok(LlamaBackend {
            model: self.clone(),
            cache,
            tokens: Vec::with_capacity(context_capacity),
        })
    }
}

fn kv_error(err: KVError) -> EngineError {
    match err {
        KVError::CapacityExceeded { seq_len, max } => EngineError::ContextOverflow {
            required: seq_len,
            capacity: max,
        },
        other => EngineError::Inference(other.to_string()),
    }
}

/// One sequence's working state over shared llama weights.
pub struct LlamaBackend {
    model: LlamaModel,
    cache: SessionKVCache,
    tokens: Vec<TokenId>,
}

impl LlamaBackend {
    pub fn params(&self) -> &LlamaHyperParams {
        &self.model.params
    }

    fn step(&mut self, token: TokenId) -> scout_engine::Result<Vec<f32>> {
        let p = &self.model.params;
        let w = &self.model.weights;
        let pos = self.tokens.len();

        let mut x = w.token_embd.row(token as usize).to_vec();
        for (i, layer) in w.layers.iter().enumerate() {
            let h = layer.attn_norm.forward(&x);
            let mut q = layer.wq.matvec(&h);
            let mut k = layer.wk.matvec(&h);
            let v = layer.wv.matvec(&h);
            self.model.rope.apply(&mut q, pos);
            self.model.rope.apply(&mut k, pos);

            self.cache.stage(i, &k, &v).map_err(kv_error)?;
            let cached = self
                .cache
                .layer(i)
                .ok_or_else(|| EngineError::Inference(format!("missing cache layer {i}")))?;
            let attn = attention(
                &q,
                p.n_heads,
                p.n_kv_heads,
                p.head_dim(),
                pos + 1,
                |t, kv| cached.key(t, kv),
                |t, kv| cached.value(t, kv),
            );
            for (xi, o) in x.iter_mut().zip(layer.wo.matvec(&attn)) {
                *xi += o;
            }

            let h = layer.ffn_norm.forward(&x);
            for (xi, f) in x.iter_mut().zip(swiglu(&layer.gate, &layer.up, &layer.down, &h)) {
                *xi += f;
            }
        }

        let x = w.output_norm.forward(&x);
        Ok(w.output().matvec(&x))
    }
}

impl ComputeBackend for LlamaBackend {
    fn vocab_size(&self) -> usize {
        self.model.params.vocab_size
    }

    fn context_capacity(&self) -> usize {
        self.cache.capacity()
    }

    fn cached_tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    fn truncate(&mut self, len: usize) {
        let len = len.min(self.tokens.len());
        self.tokens.truncate(len);
        self.cache.truncate(len);
    }

    fn forward(&mut self, token: TokenId) -> scout_engine::Result<Vec<f32>> {
        let capacity = self.context_capacity();
        if self.tokens.len() >= capacity {
            return Err(EngineError::ContextOverflow {
                required: self.tokens.len() + 1,
                capacity,
            });
        }
        if token as usize >= self.vocab_size() {
            return Err(EngineError::Inference(format!(
                "token {token} outside vocabulary of {}",
                self.vocab_size()
            )));
        }

        match self.step(token) {
            Ok(logits) => {
                self.cache.commit().map_err(kv_error)?;
                self.tokens.push(token);
                Ok(logits)
            }
            Err(e) => {
                debug!(error = %e, pos = self.tokens.len(), "forward step failed");
                self.cache.discard_staged();
                Err(e)
            }
        }
    }

    fn reset(&mut self) {
        self.tokens.clear();
        self.cache.clear();
    }
}
