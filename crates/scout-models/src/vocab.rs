//! Builds a [`VocabTokenizer`] from `tokenizer.ggml.*` metadata.

use scout_engine::{LoadError, TokenId};
use scout_tokenizer::{TokenType, VocabKind, VocabSpec, VocabTokenizer};

use crate::gguf::{GgufHeader, MetadataValue};

fn malformed(msg: impl Into<String>) -> LoadError {
    LoadError::Malformed(msg.into())
}

fn array<'a>(header: &'a GgufHeader, key: &str) -> Result<Option<&'a [MetadataValue]>, LoadError> {
    match header.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_array()
            .map(Some)
            .ok_or_else(|| malformed(format!("{key} is not an array"))),
    }
}

fn strings(items: &[MetadataValue], key: &str) -> Result<Vec<String>, LoadError> {
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| malformed(format!("{key} holds a non-string entry")))
        })
        .collect()
}

fn token_id(header: &GgufHeader, key: &str) -> Option<TokenId> {
    header.get_u64(key).and_then(|v| TokenId::try_from(v).ok())
}

pub fn vocab_spec_from_header(header: &GgufHeader) -> Result<VocabSpec, LoadError> {
    let model = header
        .get_str("tokenizer.ggml.model")
        .ok_or_else(|| malformed("missing tokenizer.ggml.model"))?;
    let kind: VocabKind = model.parse().map_err(|e: scout_tokenizer::TokenizerError| malformed(e.to_string()))?;

    let tokens = array(header, "tokenizer.ggml.tokens")?
        .ok_or_else(|| malformed("missing tokenizer.ggml.tokens"))?;
    let mut spec = VocabSpec::new(kind, strings(tokens, "tokenizer.ggml.tokens")?);

    if let Some(scores) = array(header, "tokenizer.ggml.scores")? {
        spec.scores = scores
            .iter()
            .map(|v| v.as_f32().ok_or_else(|| malformed("non-numeric token score")))
            .collect::<Result<_, _>>()?;
    }
    if let Some(types) = array(header, "tokenizer.ggml.token_type")? {
        spec.token_types = types
            .iter()
            .map(|v| {
                v.as_i64()
                    .map(|t| TokenType::from_i32(t as i32))
                    .ok_or_else(|| malformed("non-integer token type"))
            })
            .collect::<Result<_, _>>()?;
    }
    if let Some(merges) = array(header, "tokenizer.ggml.merges")? {
        spec.merges = strings(merges, "tokenizer.ggml.merges")?;
    }
    spec.bos = token_id(header, "tokenizer.ggml.bos_token_id");
    spec.eos = token_id(header, "tokenizer.ggml.eos_token_id");
    spec.unk = token_id(header, "tokenizer.ggml.unknown_token_id");
    Ok(spec)
}

/// The artifact's own tokenizer.
pub fn load_vocab(header: &GgufHeader) -> Result<VocabTokenizer, LoadError> {
    VocabTokenizer::new(vocab_spec_from_header(header)?).map_err(|e| malformed(e.to_string()))
}
