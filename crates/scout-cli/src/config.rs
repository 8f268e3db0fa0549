//! CLI configuration: an optional TOML file under command-line flags.

use std::path::{Path, PathBuf};

use scout_agents::{ExecutorConfig, PartialPolicy};
use scout_engine::LoadConfig;
use scout_sampling::SamplerConfig;
use scout_tokenizer::TemplateConfig;
use serde::Deserialize;

use crate::CliError;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub model: Option<PathBuf>,
    pub system: Option<String>,
    pub load: LoadConfig,
    pub template: TemplateConfig,
    pub sampler: SamplerConfig,
    pub executor: ExecutorConfig,
    /// What to keep from a turn interrupted with Ctrl-C.
    pub partial: PartialPolicy,
}

impl CliConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self, CliError> {
        let text = std::fs::read_to_string(path).map_err(|source| CliError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|e| CliError::Config {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// The file if given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, CliError> {
        match path {
            Some(path) => Self::from_toml_file(path),
            None => Ok(Self::default()),
        }
    }
}
