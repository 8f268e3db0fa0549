//! # scout-tokenizer
//!
//! Deterministic tokenization and chat formatting for scout.
//!
//! This crate provides:
//! - A [`TokenCodec`] trait for pluggable vocabularies
//! - [`ByteTokenizer`], a reference byte-level codec used by tests and the demo model
//! - [`VocabTokenizer`], built from the vocabulary tables stored in a GGUF artifact
//! - Streaming decoding that buffers incomplete UTF-8 sequences
//! - Chat templates, the system-preamble strategy and incremental stop detection

pub mod special;
pub mod stop;
pub mod template;
pub mod vocab;

pub use special::{Segment, SpecialMatcher};
pub use stop::{detect_stop, ScanOutcome, StopMatch, StopScanner};
pub use template::{ChatFormatter, ChatTemplate, RoleFormat, SystemPreamble, TemplateConfig};
pub use vocab::{TokenType, VocabKind, VocabSpec, VocabTokenizer};

use std::collections::HashMap;

use scout_engine::{EngineError, TokenId};

/// Error type for tokenization operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizerError {
    #[error("Invalid token ID: {0}")]
    InvalidToken(TokenId),
    #[error("Encoding error: {0}")]
    EncodingError(String),
    #[error("Invalid vocabulary: {0}")]
    InvalidVocab(String),
    #[error("Unknown chat template: {0}")]
    UnknownTemplate(String),
}

pub type TokenizerResult<T> = std::result::Result<T, TokenizerError>;

impl From<TokenizerError> for EngineError {
    fn from(err: TokenizerError) -> Self {
        EngineError::Tokenization(err.to_string())
    }
}

/// Pieces that close a chat turn in common vocabularies. When present they
/// stop generation just like the end-of-sequence token.
pub const END_OF_TURN_PIECES: &[&str] = &["<|im_end|>", "<|eot_id|>", "<|end_of_text|>"];

/// Core codec trait. Implementations can be swapped without changing app code.
pub trait TokenCodec: Send + Sync {
    /// Encode text into token IDs. Special tokens written literally in the
    /// text are recognized and emitted as single IDs.
    fn encode(&self, text: &str) -> TokenizerResult<Vec<TokenId>>;

    /// Encode text without recognizing special tokens. Used for untrusted
    /// message content so it cannot forge template markers.
    fn encode_ordinary(&self, text: &str) -> TokenizerResult<Vec<TokenId>>;

    /// Raw bytes a token stands for.
    fn token_bytes(&self, token: TokenId) -> TokenizerResult<Vec<u8>>;

    /// Get vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Look up the ID of an exact vocabulary piece.
    fn token_id(&self, piece: &str) -> Option<TokenId>;

    fn bos_token(&self) -> Option<TokenId>;

    fn eos_token(&self) -> Option<TokenId>;

    /// Tokens that end generation: end-of-sequence plus any end-of-turn
    /// control tokens the vocabulary defines.
    fn stop_tokens(&self) -> Vec<TokenId> {
        let mut stops: Vec<TokenId> = self.eos_token().into_iter().collect();
        for piece in END_OF_TURN_PIECES {
            if let Some(id) = self.token_id(piece) {
                if !stops.contains(&id) {
                    stops.push(id);
                }
            }
        }
        stops
    }

    /// Decode a complete sequence of tokens into text. Invalid UTF-8 is
    /// replaced with U+FFFD.
    fn decode(&self, tokens: &[TokenId]) -> TokenizerResult<String> {
        let mut bytes = Vec::with_capacity(tokens.len() * 2);
        for &token in tokens {
            bytes.extend_from_slice(&self.token_bytes(token)?);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Decode a single token and accumulate with partial UTF-8 state.
    /// Returns only the text that became complete with this token.
    fn decode_token(&self, token: TokenId, state: &mut DecodingState) -> TokenizerResult<String> {
        let bytes = self.token_bytes(token)?;
        Ok(state.push_bytes(&bytes))
    }
}

/// Streaming decoding state for handling partial UTF-8 sequences.
#[derive(Debug, Clone, Default)]
pub struct DecodingState {
    buffer: String,
    pending_utf8: Vec<u8>,
}

impl DecodingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything emitted so far.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Bytes held back waiting for the rest of a multi-byte character.
    pub fn pending(&self) -> &[u8] {
        &self.pending_utf8
    }

    /// Append raw bytes and return the newly completed text.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> String {
        self.pending_utf8.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending_utf8) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending_utf8.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending_utf8[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            self.pending_utf8.drain(..valid);
                            break;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending_utf8.drain(..valid + len);
                        }
                    }
                }
            }
        }
        self.buffer.push_str(&out);
        out
    }

    /// Emit whatever is still pending, lossily.
    pub fn flush(&mut self) -> String {
        if self.pending_utf8.is_empty() {
            return String::new();
        }
        let out = String::from_utf8_lossy(&self.pending_utf8).into_owned();
        self.pending_utf8.clear();
        self.buffer.push_str(&out);
        out
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.pending_utf8.clear();
    }
}

/// Number of byte tokens in a [`ByteTokenizer`]; special tokens follow them.
pub const BYTE_VOCAB: usize = 256;

/// Reference byte-level codec.
///
/// - IDs `0..256` are raw bytes, so every string round-trips exactly
/// - Special tokens are appended after the byte range
/// - `<s>` / `</s>`, when present, serve as BOS / EOS
pub struct ByteTokenizer {
    specials: Vec<String>,
    special_ids: HashMap<String, TokenId>,
    matcher: SpecialMatcher,
}

impl ByteTokenizer {
    /// Byte codec with `<s>` and `</s>`.
    pub fn new() -> Self {
        Self::with_special_tokens(["<s>", "</s>"])
    }

    /// Byte codec with ChatML control tokens.
    pub fn chatml() -> Self {
        Self::with_special_tokens(["<s>", "</s>", "<|im_start|>", "<|im_end|>"])
    }

    pub fn with_special_tokens<I, S>(specials: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let specials: Vec<String> = specials.into_iter().map(Into::into).collect();
        let special_ids: HashMap<String, TokenId> = specials
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), (BYTE_VOCAB + i) as TokenId))
            .collect();
        let matcher = SpecialMatcher::new(special_ids.iter().map(|(s, &id)| (s.clone(), id)));
        Self {
            specials,
            special_ids,
            matcher,
        }
    }

    /// Special token pieces in ID order.
    pub fn special_tokens(&self) -> &[String] {
        &self.specials
    }
}

impl Default for ByteTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCodec for ByteTokenizer {
    fn encode(&self, text: &str) -> TokenizerResult<Vec<TokenId>> {
        let mut ids = Vec::with_capacity(text.len());
        for segment in self.matcher.split(text) {
            match segment {
                Segment::Special(id) => ids.push(id),
                Segment::Text(s) => ids.extend(s.bytes().map(TokenId::from)),
            }
        }
        Ok(ids)
    }

    fn encode_ordinary(&self, text: &str) -> TokenizerResult<Vec<TokenId>> {
        Ok(text.bytes().map(TokenId::from).collect())
    }

    fn token_bytes(&self, token: TokenId) -> TokenizerResult<Vec<u8>> {
        let idx = token as usize;
        if idx < BYTE_VOCAB {
            return Ok(vec![idx as u8]);
        }
        self.specials
            .get(idx - BYTE_VOCAB)
            .map(|s| s.as_bytes().to_vec())
            .ok_or(TokenizerError::InvalidToken(token))
    }

    fn vocab_size(&self) -> usize {
        BYTE_VOCAB + self.specials.len()
    }

    fn token_id(&self, piece: &str) -> Option<TokenId> {
        if let Some(&id) = self.special_ids.get(piece) {
            return Some(id);
        }
        match piece.as_bytes() {
            [b] => Some(TokenId::from(*b)),
            _ => None,
        }
    }

    fn bos_token(&self) -> Option<TokenId> {
        self.special_ids.get("<s>").copied()
    }

    fn eos_token(&self) -> Option<TokenId> {
        self.special_ids.get("</s>").copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_one_id_per_byte() {
        let tok = ByteTokenizer::new();
        assert_eq!(tok.encode("hi").unwrap(), vec![104, 105]);
        assert_eq!(tok.encode("é").unwrap().len(), 2);
    }

    #[test]
    fn encode_empty_string() {
        let tok = ByteTokenizer::new();
        assert!(tok.encode("").unwrap().is_empty());
    }

    #[test]
    fn specials_are_matched_literally() {
        let tok = ByteTokenizer::chatml();
        let im_start = tok.token_id("<|im_start|>").unwrap();
        let ids = tok.encode("<|im_start|>user").unwrap();
        assert_eq!(ids[0], im_start);
        assert_eq!(ids.len(), 1 + "user".len());
    }

    #[test]
    fn encode_ordinary_ignores_specials() {
        let tok = ByteTokenizer::chatml();
        let ids = tok.encode_ordinary("<|im_end|>").unwrap();
        assert_eq!(ids.len(), "<|im_end|>".len());
        assert!(ids.iter().all(|&id| (id as usize) < BYTE_VOCAB));
    }

    #[test]
    fn decode_roundtrip() {
        let tok = ByteTokenizer::new();
        let original = "hello  world\n\ttest ✓";
        let encoded = tok.encode(original).unwrap();
        assert_eq!(tok.decode(&encoded).unwrap(), original);
    }

    #[test]
    fn decode_invalid_token_errors() {
        let tok = ByteTokenizer::new();
        assert_eq!(
            tok.decode(&[999]).unwrap_err(),
            TokenizerError::InvalidToken(999)
        );
    }

    #[test]
    fn streaming_decode_buffers_partial_utf8() {
        let tok: &dyn TokenCodec = &ByteTokenizer::new();
        let ids = tok.encode("é!").unwrap();
        let mut state = DecodingState::new();
        assert_eq!(tok.decode_token(ids[0], &mut state).unwrap(), "");
        assert_eq!(state.pending().len(), 1);
        assert_eq!(tok.decode_token(ids[1], &mut state).unwrap(), "é");
        assert_eq!(tok.decode_token(ids[2], &mut state).unwrap(), "!");
        assert_eq!(state.buffer(), "é!");

        state.clear();
        assert_eq!(state.buffer(), "");
    }

    #[test]
    fn invalid_bytes_become_replacement_chars() {
        let mut state = DecodingState::new();
        assert_eq!(state.push_bytes(&[0xFF, b'a']), "\u{FFFD}a");
    }

    #[test]
    fn flush_emits_dangling_bytes() {
        let mut state = DecodingState::new();
        assert_eq!(state.push_bytes(&[0xE2, 0x9C]), "");
        assert_eq!(state.flush(), "\u{FFFD}");
        assert!(state.pending().is_empty());
    }

    #[test]
    fn stop_tokens_include_end_of_turn() {
        let tok = ByteTokenizer::chatml();
        let stops = tok.stop_tokens();
        assert_eq!(stops[0], tok.eos_token().unwrap());
        assert!(stops.contains(&tok.token_id("<|im_end|>").unwrap()));
    }

    #[test]
    fn tokenizer_error_maps_to_engine_error() {
        let err: EngineError = TokenizerError::InvalidToken(7).into();
        assert!(matches!(err, EngineError::Tokenization(_)));
    }
}
