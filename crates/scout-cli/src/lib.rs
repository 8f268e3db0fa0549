//! # scout-cli
//!
//! Command-line surface for scout.
//!
//! Wires: model artifact → [`ModelRuntime`] → [`Session`] → stdout. The
//! binary adds argument parsing and signal handling; everything it runs
//! lives here so it can be tested without a terminal.

pub mod config;
pub mod repl;

pub use config::CliConfig;
pub use repl::{Repl, ReplCommand};

use std::io::Write;
use std::path::Path;

use scout_agents::{PartialPolicy, Session, SessionError, Transcript};
use scout_engine::{GenerationResult, LoadError, Message, QuantizationTag};
use scout_models::{write_tiny_model, GgufFile, LlamaHyperParams, MetadataValue, TinyModelConfig};
use scout_runtime::{CancellationToken, Model, ModelRuntime};
use scout_tokenizer::TokenizerError;

/// Errors surfaced by CLI commands.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Template(#[from] TokenizerError),
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {message}")]
    Config { path: String, message: String },
    #[error("invalid history file {path}: {message}")]
    History { path: String, message: String },
    #[error("no model given: pass --model or set `model` in the config file")]
    NoModel,
}

/// Load the configured model, with `path` taking precedence over the config.
pub fn load_model(path: Option<&Path>, config: &CliConfig) -> Result<Model, CliError> {
    let path = path.or(config.model.as_deref()).ok_or(CliError::NoModel)?;
    Ok(ModelRuntime::new().load(path, &config.load)?)
}

/// A session on `model` configured from `config`.
pub fn new_session(model: Model, config: &CliConfig) -> Result<Session, CliError> {
    let template = config.template.resolve(model.codec().as_ref())?;
    let mut session = Session::new(model, template).with_sampler(config.sampler.clone())?;
    if let Some(system) = &config.system {
        session = session.with_system(system.clone())?;
    }
    Ok(session)
}

/// Restore the session saved at `path`, or start a new one if the file does
/// not exist yet.
pub fn open_history(model: Model, config: &CliConfig, path: &Path) -> Result<Session, CliError> {
    if !path.exists() {
        return new_session(model, config);
    }
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let transcript: Transcript = serde_json::from_str(&text).map_err(|e| CliError::History {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let template = config.template.resolve(model.codec().as_ref())?;
    let mut session = Session::restore(model, template, transcript)?;
    session.set_sampler(config.sampler.clone())?;
    tracing::info!(path = %path.display(), messages = session.len(), "history restored");
    Ok(session)
}

/// Write the session transcript as pretty JSON.
pub fn save_history(session: &Session, path: &Path) -> Result<(), CliError> {
    let io_err = |source| CliError::Io {
        path: path.display().to_string(),
        source,
    };
    let json = serde_json::to_string_pretty(&session.transcript())
        .map_err(|e| io_err(std::io::Error::other(e)))?;
    std::fs::write(path, json).map_err(io_err)
}

/// Run one turn on `session` for `prompt`, streaming fragments to `out`.
pub fn stream_turn<W: Write>(
    session: &mut Session,
    prompt: &str,
    cancel: CancellationToken,
    policy: PartialPolicy,
    out: &mut W,
) -> Result<GenerationResult, CliError> {
    session.append(Message::user(prompt))?;
    let mut write_error = None;
    let result = session.generate_turn_with(None, cancel, policy, |fragment| {
        if write_error.is_none() {
            if let Err(e) = out.write_all(fragment.as_bytes()).and_then(|_| out.flush()) {
                write_error = Some(e);
            }
        }
    })?;
    if let Some(source) = write_error {
        return Err(CliError::Io {
            path: "<output>".into(),
            source,
        });
    }
    Ok(result)
}

/// One-shot generation: a fresh session, one user message, one reply.
pub fn generate<W: Write>(
    model: Model,
    config: &CliConfig,
    prompt: &str,
    out: &mut W,
) -> Result<GenerationResult, CliError> {
    let mut session = new_session(model, config)?;
    stream_turn(
        &mut session,
        prompt,
        CancellationToken::new(),
        PartialPolicy::Discard,
        out,
    )
}

/// Write the tiny seeded demo model to `path`.
pub fn demo_model(path: &Path, quantization: QuantizationTag, seed: u64) -> Result<(), CliError> {
    let config = TinyModelConfig::default()
        .with_quantization(quantization)
        .with_seed(seed);
    Ok(write_tiny_model(path, &config)?)
}

fn describe_value(value: &MetadataValue) -> String {
    if let Some(items) = value.as_array() {
        return format!("[{} items]", items.len());
    }
    if let Some(s) = value.as_str() {
        return format!("{s:?}");
    }
    if let Some(b) = value.as_bool() {
        return b.to_string();
    }
    if let Some(n) = value.as_i64() {
        return n.to_string();
    }
    if let Some(n) = value.as_u64() {
        return n.to_string();
    }
    if let Some(f) = value.as_f32() {
        return f.to_string();
    }
    format!("{value:?}")
}

/// Write a human-readable summary of a GGUF artifact's header to `out`.
pub fn inspect<W: Write>(path: &Path, out: &mut W) -> Result<(), CliError> {
    let file = GgufFile::open(path)?;
    write_summary(path, &file, out).map_err(|source| CliError::Io {
        path: "<output>".into(),
        source,
    })
}

fn write_summary<W: Write>(path: &Path, file: &GgufFile, out: &mut W) -> std::io::Result<()> {
    let header = file.header();
    writeln!(out, "file:       {}", path.display())?;
    writeln!(out, "size:       {} bytes", file.file_size())?;
    writeln!(out, "version:    {}", header.version)?;
    writeln!(out, "tensors:    {}", header.tensors.len())?;
    if let Some(ty) = header.dominant_weight_type() {
        writeln!(out, "weights:    {ty}")?;
    }
    match LlamaHyperParams::from_header(header) {
        Ok(p) => {
            writeln!(
                out,
                "layers:     {} (d_model {}, heads {}/{} kv, ff {})",
                p.n_layers, p.d_model, p.n_heads, p.n_kv_heads, p.d_ff
            )?;
            writeln!(out, "vocab:      {}", p.vocab_size)?;
            writeln!(out, "context:    {}", p.context_length)?;
        }
        Err(e) => writeln!(out, "hyperparameters unavailable: {e}")?,
    }
    writeln!(out, "metadata:")?;
    for (key, value) in &header.metadata {
        writeln!(out, "  {key} = {}", describe_value(value))?;
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts `room` bytes, then fails every write.
    struct ShortWriter {
        room: usize,
    }

    impl Write for ShortWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.room == 0 {
                return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"));
            }
            let n = buf.len().min(self.room);
            self.room -= n;
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn inspect_reports_output_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.gguf");
        demo_model(&path, QuantizationTag::F32, 1).unwrap();

        let err = inspect(&path, &mut ShortWriter { room: 40 }).unwrap_err();
        match err {
            CliError::Io { path, source } => {
                assert_eq!(path, "<output>");
                assert_eq!(source.kind(), std::io::ErrorKind::BrokenPipe);
            }
            other => panic!("unexpected error: {other}"),
        }
        let mut out = Vec::new();
        inspect(&path, &mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("file:"));
    }

    #[test]
    fn generate_streams_what_it_returns() {
        let model = Model::scripted(&["Hello there"], 256).unwrap();
        let config = CliConfig {
            sampler: scout_sampling::SamplerConfig::greedy().with_max_new_tokens(32),
            ..CliConfig::default()
        };
        let mut out = Vec::new();
        let result = generate(model, &config, "hi", &mut out).unwrap();
        assert_eq!(result.text, "Hello there");
        assert_eq!(String::from_utf8(out).unwrap(), "Hello there");
    }

    #[test]
    fn missing_model_is_reported() {
        assert!(matches!(
            load_model(None, &CliConfig::default()),
            Err(CliError::NoModel)
        ));
    }

    #[test]
    fn describe_value_summarizes_arrays() {
        let tokens = MetadataValue::string_array(["a", "b", "c"]);
        assert_eq!(describe_value(&tokens), "[3 items]");
        assert_eq!(describe_value(&MetadataValue::String("llama".into())), "\"llama\"");
    }
}
