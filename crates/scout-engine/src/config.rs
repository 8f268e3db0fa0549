//! Model load configuration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Weight quantization schemes a model artifact may declare.
///
/// The runtime computes with every variant listed here; artifacts using any
/// other scheme are rejected at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuantizationTag {
    #[serde(rename = "F32", alias = "f32")]
    F32,
    #[serde(rename = "F16", alias = "f16")]
    F16,
    #[serde(rename = "Q8_0", alias = "q8_0")]
    Q8_0,
    #[serde(rename = "Q4_0", alias = "q4_0")]
    Q4_0,
    #[serde(rename = "Q4_1", alias = "q4_1")]
    Q4_1,
}

impl QuantizationTag {
    pub fn all() -> &'static [QuantizationTag] {
        &[
            QuantizationTag::F32,
            QuantizationTag::F16,
            QuantizationTag::Q8_0,
            QuantizationTag::Q4_0,
            QuantizationTag::Q4_1,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QuantizationTag::F32 => "F32",
            QuantizationTag::F16 => "F16",
            QuantizationTag::Q8_0 => "Q8_0",
            QuantizationTag::Q4_0 => "Q4_0",
            QuantizationTag::Q4_1 => "Q4_1",
        }
    }
}

impl fmt::Display for QuantizationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuantizationTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QuantizationTag::all()
            .iter()
            .copied()
            .find(|tag| tag.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown quantization tag: {s}"))
    }
}

/// Configuration for loading a model artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Layers to offload to a GPU. CPU builds run every layer on the CPU.
    #[serde(default)]
    pub gpu_layers: u32,

    /// Context window to allocate working state for. Clamped to the
    /// artifact's trained context length.
    #[serde(default = "default_context_capacity")]
    pub context_capacity: usize,

    /// Expected quantization. `None` accepts whatever supported scheme the
    /// artifact uses.
    #[serde(default)]
    pub quantization: Option<QuantizationTag>,

    /// Upper bound on resident bytes (weights + working state).
    #[serde(default)]
    pub memory_limit_bytes: Option<u64>,
}

fn default_context_capacity() -> usize {
    2048
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            gpu_layers: 0,
            context_capacity: default_context_capacity(),
            quantization: None,
            memory_limit_bytes: None,
        }
    }
}

impl LoadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gpu_layers(mut self, layers: u32) -> Self {
        self.gpu_layers = layers;
        self
    }

    pub fn with_context_capacity(mut self, tokens: usize) -> Self {
        self.context_capacity = tokens;
        self
    }

    pub fn with_quantization(mut self, tag: QuantizationTag) -> Self {
        self.quantization = Some(tag);
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_parses_case_insensitively() {
        assert_eq!("q8_0".parse::<QuantizationTag>().unwrap(), QuantizationTag::Q8_0);
        assert_eq!("F16".parse::<QuantizationTag>().unwrap(), QuantizationTag::F16);
        assert!("Q4_K".parse::<QuantizationTag>().is_err());
    }

    #[test]
    fn load_config_defaults_from_empty_json() {
        let config: LoadConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, LoadConfig::default());
        assert_eq!(config.context_capacity, 2048);
    }

    #[test]
    fn load_config_builder() {
        let config = LoadConfig::new()
            .with_context_capacity(512)
            .with_quantization(QuantizationTag::Q4_0)
            .with_memory_limit(1 << 30);
        assert_eq!(config.context_capacity, 512);
        assert_eq!(config.quantization, Some(QuantizationTag::Q4_0));
        assert_eq!(config.memory_limit_bytes, Some(1 << 30));
    }
}
