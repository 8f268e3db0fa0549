//! Server configuration, read from an optional TOML file and overridden by
//! command-line flags.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use scout_agents::GatewayConfig;
use scout_engine::LoadConfig;
use scout_sampling::SamplerConfig;
use scout_tokenizer::TemplateConfig;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// GGUF artifact to serve.
    pub model_path: Option<PathBuf>,
    /// Name reported in API responses. Defaults to the artifact's name.
    pub model_name: Option<String>,
    pub load: LoadConfig,
    pub template: TemplateConfig,
    /// Defaults for every turn; requests may override individual fields.
    pub sampler: SamplerConfig,
    pub gateway: GatewayConfig,
    /// Turns generating at once across all sessions.
    pub max_concurrent_turns: usize,
    /// Sessions held in memory.
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            model_path: None,
            model_name: None,
            load: LoadConfig::default(),
            template: TemplateConfig::default(),
            sampler: SamplerConfig::default(),
            gateway: GatewayConfig::default(),
            max_concurrent_turns: 4,
            max_sessions: 64,
        }
    }
}

impl ServerConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            bind = "0.0.0.0:9000"
            max_concurrent_turns = 2

            [sampler]
            temperature = 0.0

            [template]
            preset = "chatml"
            "#,
        )
        .unwrap();
        assert_eq!(config.bind.port(), 9000);
        assert_eq!(config.max_concurrent_turns, 2);
        assert_eq!(config.max_sessions, 64);
        assert_eq!(config.sampler.temperature, 0.0);
        assert_eq!(config.sampler.max_new_tokens, SamplerConfig::default().max_new_tokens);
        assert_eq!(config.template.preset.as_deref(), Some("chatml"));
        assert_eq!(config.gateway, GatewayConfig::default());
    }

    #[test]
    fn missing_file_is_reported_with_path() {
        let err = ServerConfig::from_toml_file(Path::new("/nonexistent/scout.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/scout.toml"));
    }
}
