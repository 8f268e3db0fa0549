//! # scout-runtime
//!
//! Loads model artifacts and runs generation against them.
//!
//! - [`ModelRuntime::load`] validates a GGUF artifact against a
//!   [`LoadConfig`] and produces a shared [`Model`] handle
//! - [`Model::generate`] leases the model's compute backend exclusively and
//!   returns a lazy [`TokenStream`]; [`Model::generate_text`] adds decoding
//!   and stop-sequence scanning
//! - [`telemetry`] hooks report TTFT, throughput and finish reasons
//!
//! ## Exclusive lease
//! A [`Model`] owns exactly one backend (weights plus working state). Every
//! generation call holds the backend mutex for its whole lifetime, so calls
//! from concurrent sessions serialize here rather than interleaving steps.
//!
//! ## Prefix reuse
//! The backend remembers which tokens its working state holds. A new call
//! truncates to the longest common prefix with the new prompt and only
//! prefills the rest, which makes multi-turn sessions cost one turn of
//! prefill instead of the whole transcript.

pub mod scripted;
pub mod stream;
pub mod telemetry;

pub use scripted::ScriptedBackend;
pub use stream::{TextStream, TokenStream};
pub use telemetry::{
    InferenceMetrics, InferenceTimer, LogTelemetry, NoopTelemetry, PromptReport, TelemetryHook,
    TracingTelemetry,
};

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use scout_engine::{
    ComputeBackend, EngineError, LoadConfig, LoadError, ModelInfo, Result, TokenId,
};
use scout_models::{load_vocab, GgufFile, LlamaHyperParams, LlamaModel};
use scout_sampling::{Sampler, SamplerConfig};
use scout_tokenizer::TokenCodec;
use tracing::{debug, info, warn};

pub use tokio_util::sync::CancellationToken;

/// Loads artifacts into [`Model`]s.
#[derive(Clone)]
pub struct ModelRuntime {
    telemetry: Arc<dyn TelemetryHook>,
}

impl Default for ModelRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRuntime {
    pub fn new() -> Self {
        Self {
            telemetry: Arc::new(TracingTelemetry),
        }
    }

    /// Hook that receives metrics for every generation on loaded models.
    pub fn with_telemetry(mut self, hook: Arc<dyn TelemetryHook>) -> Self {
        self.telemetry = hook;
        self
    }

    /// Load a GGUF artifact.
    ///
    /// Fails with [`LoadError`] on a malformed artifact, an architecture or
    /// quantization this build cannot run, a quantization other than the
    /// configured one, or a resident size above `memory_limit_bytes`.
    pub fn load(&self, path: &Path, config: &LoadConfig) -> std::result::Result<Model, LoadError> {
        let file = GgufFile::open(path)?;
        let header = file.header();

        let params = LlamaHyperParams::from_header(header)?;

        if let Some(t) = header
            .tensors
            .iter()
            .find(|t| t.ggml_type.quantization_tag().is_none())
        {
            return Err(LoadError::UnsupportedQuantization(t.ggml_type.name()));
        }
        let quantization = header
            .dominant_weight_type()
            .and_then(|t| t.quantization_tag())
            .ok_or_else(|| LoadError::Malformed("artifact has no weight matrices".into()))?;
        if let Some(expected) = config.quantization {
            if expected != quantization {
                return Err(LoadError::QuantizationMismatch {
                    expected,
                    found: quantization,
                });
            }
        }

        let context = match config.context_capacity {
            0 => params.context_length,
            n if n > params.context_length => {
                warn!(
                    requested = n,
                    trained = params.context_length,
                    "context capacity clamped to trained length"
                );
                params.context_length
            }
            n => n,
        };

        if config.gpu_layers > 0 {
            warn!(
                gpu_layers = config.gpu_layers,
                "GPU offload is not available in this build; running all layers on CPU"
            );
        }

        let required = params.estimate_resident_bytes(header, context);
        if let Some(available) = config.memory_limit_bytes {
            if required > available {
                return Err(LoadError::InsufficientMemory {
                    required,
                    available,
                });
            }
        }

        let codec = load_vocab(header)?;
        if codec.vocab_size() != params.vocab_size {
            return Err(LoadError::Malformed(format!(
                "tokenizer has {} tokens but the embedding has {} rows",
                codec.vocab_size(),
                params.vocab_size
            )));
        }

        let model = LlamaModel::load(&file)?;
        let backend = model.backend(context)?;

        let name = header
            .get_str("general.name")
            .map(str::to_string)
            .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "model".to_string());
        let info = ModelInfo {
            name,
            architecture: scout_models::ARCHITECTURE.to_string(),
            vocab_size: params.vocab_size,
            context_capacity: context,
            quantization,
            bos_token: codec.bos_token(),
            stop_tokens: codec.stop_tokens(),
        };
        info!(
            model = %info.name,
            path = %path.display(),
            quantization = %quantization,
            context,
            resident_bytes = required,
            "model loaded"
        );

        Ok(Model::from_parts_with_telemetry(
            info,
            Arc::new(codec),
            Box::new(backend),
            self.telemetry.clone(),
        ))
    }
}

struct ModelInner {
    info: ModelInfo,
    codec: Arc<dyn TokenCodec>,
    backend: Mutex<Box<dyn ComputeBackend>>,
    telemetry: Arc<dyn TelemetryHook>,
}

/// Shared handle to a loaded model. Cloning is cheap; every clone leases
/// the same backend.
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model").field("info", &self.inner.info).finish()
    }
}

impl Model {
    /// Assemble a model from an already-built codec and backend.
    pub fn from_parts(
        info: ModelInfo,
        codec: Arc<dyn TokenCodec>,
        backend: Box<dyn ComputeBackend>,
    ) -> Self {
        Self::from_parts_with_telemetry(info, codec, backend, Arc::new(TracingTelemetry))
    }

    pub fn from_parts_with_telemetry(
        info: ModelInfo,
        codec: Arc<dyn TokenCodec>,
        backend: Box<dyn ComputeBackend>,
        telemetry: Arc<dyn TelemetryHook>,
    ) -> Self {
        Self {
            inner: Arc::new(ModelInner {
                info,
                codec,
                backend: Mutex::new(backend),
                telemetry,
            }),
        }
    }

    pub fn info(&self) -> &ModelInfo {
        &self.inner.info
    }

    pub fn codec(&self) -> &Arc<dyn TokenCodec> {
        &self.inner.codec
    }

    pub fn context_capacity(&self) -> usize {
        self.inner.info.context_capacity
    }

    fn lease(&self) -> Result<MutexGuard<'_, Box<dyn ComputeBackend>>> {
        self.inner
            .backend
            .lock()
            .map_err(|_| EngineError::Inference("compute backend poisoned by a panic".into()))
    }

    /// Like [`Model::lease`], but fails with [`EngineError::Busy`] instead of
    /// waiting for another generation to finish.
    fn try_lease(&self) -> Result<MutexGuard<'_, Box<dyn ComputeBackend>>> {
        match self.inner.backend.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(EngineError::Busy(format!(
                "model {} is serving another generation",
                self.inner.info.name
            ))),
            Err(TryLockError::Poisoned(_)) => Err(EngineError::Inference(
                "compute backend poisoned by a panic".into(),
            )),
        }
    }

    /// Number of tokens currently held in the backend's working state.
    pub fn cached_len(&self) -> Result<usize> {
        Ok(self.lease()?.cached_tokens().len())
    }

    /// Start generating after `prefix`. Blocks until the backend is free.
    ///
    /// Fails with [`EngineError::ContextOverflow`] when the prefix plus
    /// `max_new_tokens` cannot fit in the context window; the runtime never
    /// drops history on its own.
    pub fn generate(
        &self,
        prefix: &[TokenId],
        config: &SamplerConfig,
        cancel: CancellationToken,
    ) -> Result<TokenStream<'_>> {
        self.check_request(prefix, config)?;
        let backend = self.lease()?;
        Ok(self.start(backend, prefix, config, cancel))
    }

    /// [`Model::generate`] without waiting for the backend.
    pub fn try_generate(
        &self,
        prefix: &[TokenId],
        config: &SamplerConfig,
        cancel: CancellationToken,
    ) -> Result<TokenStream<'_>> {
        self.check_request(prefix, config)?;
        let backend = self.try_lease()?;
        Ok(self.start(backend, prefix, config, cancel))
    }

    /// Generate decoded text, halting on `config.stop_sequences` and on
    /// `extra_stops` (e.g. chat template role markers).
    pub fn generate_text(
        &self,
        prefix: &[TokenId],
        config: &SamplerConfig,
        extra_stops: &[String],
        cancel: CancellationToken,
    ) -> Result<TextStream<'_>> {
        let tokens = self.generate(prefix, config, cancel)?;
        let mut stops = config.stop_sequences.clone();
        stops.extend(extra_stops.iter().cloned());
        Ok(TextStream::new(tokens, self.inner.codec.clone(), &stops))
    }

    fn check_request(&self, prefix: &[TokenId], config: &SamplerConfig) -> Result<()> {
        config
            .validate()
            .map_err(|e| EngineError::Inference(e.to_string()))?;
        if prefix.is_empty() {
            return Err(EngineError::Tokenization("empty prompt".into()));
        }
        let capacity = self.context_capacity();
        let required = prefix.len() + config.max_new_tokens;
        if required > capacity {
            return Err(EngineError::ContextOverflow { required, capacity });
        }
        Ok(())
    }

    fn start<'a>(
        &'a self,
        mut backend: MutexGuard<'a, Box<dyn ComputeBackend>>,
        prefix: &[TokenId],
        config: &SamplerConfig,
        cancel: CancellationToken,
    ) -> TokenStream<'a> {
        let common = backend
            .cached_tokens()
            .iter()
            .zip(prefix)
            .take_while(|(a, b)| a == b)
            .count();
        // The last prompt token is always re-fed to obtain fresh logits.
        let reused = common.min(prefix.len() - 1);
        backend.truncate(reused);
        debug!(
            prompt_tokens = prefix.len(),
            reused,
            max_new_tokens = config.max_new_tokens,
            "generation started"
        );

        let timer = InferenceTimer::new(
            self.inner.info.name.clone(),
            prefix.len() - reused,
            reused,
            self.inner.telemetry.clone(),
        );
        TokenStream::new(
            backend,
            Sampler::new(config.clone()),
            cancel,
            prefix.to_vec(),
            reused,
            self.inner.info.stop_tokens.clone(),
            timer,
        )
    }
}
