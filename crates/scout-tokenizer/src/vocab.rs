//! Vocabulary-table codecs as stored in GGUF artifacts (`tokenizer.ggml.*`).
//!
//! Two families are supported:
//! - `llama`: SentencePiece-style pieces scored for greedy pair merging,
//!   `▁` standing for a space and `<0xNN>` pieces as byte fallback.
//! - `gpt2`: byte-level BPE with ranked merges over a printable byte alphabet.
//!
//! No dummy-prefix space is inserted before the first word, so
//! `decode(encode(text)) == text` for every text whose bytes the vocabulary
//! can represent. Bytes with no representation encode to the unknown token.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::OnceLock;

use scout_engine::TokenId;
use serde::{Deserialize, Serialize};

use crate::special::{Segment, SpecialMatcher};
use crate::{TokenCodec, TokenizerError, TokenizerResult};

const SPM_SPACE: char = '\u{2581}';

/// Tokenizer family (`tokenizer.ggml.model`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VocabKind {
    #[serde(rename = "llama")]
    SentencePiece,
    #[serde(rename = "gpt2")]
    BytePairBpe,
}

impl VocabKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VocabKind::SentencePiece => "llama",
            VocabKind::BytePairBpe => "gpt2",
        }
    }
}

impl FromStr for VocabKind {
    type Err = TokenizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llama" => Ok(VocabKind::SentencePiece),
            "gpt2" => Ok(VocabKind::BytePairBpe),
            other => Err(TokenizerError::InvalidVocab(format!(
                "unsupported tokenizer model: {other}"
            ))),
        }
    }
}

/// Per-token type (`tokenizer.ggml.token_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    Normal,
    Unknown,
    Control,
    UserDefined,
    Unused,
    Byte,
}

impl TokenType {
    pub fn from_i32(v: i32) -> Self {
        match v {
            2 => TokenType::Unknown,
            3 => TokenType::Control,
            4 => TokenType::UserDefined,
            5 => TokenType::Unused,
            6 => TokenType::Byte,
            _ => TokenType::Normal,
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            TokenType::Normal => 1,
            TokenType::Unknown => 2,
            TokenType::Control => 3,
            TokenType::UserDefined => 4,
            TokenType::Unused => 5,
            TokenType::Byte => 6,
        }
    }

    /// Matched literally in input rather than assembled from subwords.
    fn is_special(&self) -> bool {
        matches!(self, TokenType::Control | TokenType::UserDefined)
    }
}

/// Raw vocabulary tables.
#[derive(Debug, Clone)]
pub struct VocabSpec {
    pub kind: VocabKind,
    pub tokens: Vec<String>,
    /// Merge priority per token (SentencePiece). May be empty.
    pub scores: Vec<f32>,
    /// May be empty, in which case types are inferred from the pieces.
    pub token_types: Vec<TokenType>,
    /// Ranked `"left right"` merge rules (BPE). May be empty.
    pub merges: Vec<String>,
    pub bos: Option<TokenId>,
    pub eos: Option<TokenId>,
    pub unk: Option<TokenId>,
}

impl VocabSpec {
    pub fn new(kind: VocabKind, tokens: Vec<String>) -> Self {
        Self {
            kind,
            tokens,
            scores: Vec::new(),
            token_types: Vec::new(),
            merges: Vec::new(),
            bos: None,
            eos: None,
            unk: None,
        }
    }
}

/// GPT-2 byte-to-printable-character table.
fn byte_chars() -> &'static [char; 256] {
    static TABLE: OnceLock<[char; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = ['\0'; 256];
        let mut extra = 0u32;
        for b in 0..=255u8 {
            let printable = matches!(b, b'!'..=b'~' | 0xA1..=0xAC | 0xAE..=0xFF);
            table[b as usize] = if printable {
                char::from(b)
            } else {
                let c = char::from_u32(256 + extra).unwrap_or(char::REPLACEMENT_CHARACTER);
                extra += 1;
                c
            };
        }
        table
    })
}

/// Vocabulary piece for a raw byte in byte-level BPE vocabularies.
pub fn byte_level_char(b: u8) -> char {
    byte_chars()[b as usize]
}

/// SentencePiece byte-fallback piece for a raw byte.
pub fn byte_fallback_piece(b: u8) -> String {
    format!("<0x{b:02X}>")
}

fn parse_byte_fallback(piece: &str) -> Option<u8> {
    let hex = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

fn infer_type(kind: VocabKind, piece: &str) -> TokenType {
    if kind == VocabKind::SentencePiece && parse_byte_fallback(piece).is_some() {
        return TokenType::Byte;
    }
    match piece {
        "<unk>" => TokenType::Unknown,
        "<s>" | "</s>" => TokenType::Control,
        p if p.len() > 4 && p.starts_with("<|") && p.ends_with("|>") => TokenType::Control,
        _ => TokenType::Normal,
    }
}

/// Codec over a GGUF-style vocabulary table.
pub struct VocabTokenizer {
    kind: VocabKind,
    pieces: Vec<String>,
    types: Vec<TokenType>,
    scores: Vec<f32>,
    piece_to_id: HashMap<String, TokenId>,
    merge_ranks: HashMap<(String, String), usize>,
    byte_tokens: Vec<Option<TokenId>>,
    char_to_byte: HashMap<char, u8>,
    specials: SpecialMatcher,
    bos: Option<TokenId>,
    eos: Option<TokenId>,
    unk: Option<TokenId>,
}

impl std::fmt::Debug for VocabTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VocabTokenizer")
            .field("kind", &self.kind)
            .field("vocab_size", &self.pieces.len())
            .field("merges", &self.merge_ranks.len())
            .field("bos", &self.bos)
            .field("eos", &self.eos)
            .finish()
    }
}

impl VocabTokenizer {
    pub fn new(spec: VocabSpec) -> TokenizerResult<Self> {
        let n = spec.tokens.len();
        if n == 0 {
            return Err(TokenizerError::InvalidVocab("empty vocabulary".into()));
        }
        if !spec.scores.is_empty() && spec.scores.len() != n {
            return Err(TokenizerError::InvalidVocab(format!(
                "{} scores for {n} tokens",
                spec.scores.len()
            )));
        }
        if !spec.token_types.is_empty() && spec.token_types.len() != n {
            return Err(TokenizerError::InvalidVocab(format!(
                "{} token types for {n} tokens",
                spec.token_types.len()
            )));
        }
        for (name, id) in [("bos", spec.bos), ("eos", spec.eos), ("unk", spec.unk)] {
            if let Some(id) = id {
                if id as usize >= n {
                    return Err(TokenizerError::InvalidVocab(format!(
                        "{name} token {id} outside vocabulary of {n}"
                    )));
                }
            }
        }

        let types: Vec<TokenType> = if spec.token_types.is_empty() {
            spec.tokens.iter().map(|p| infer_type(spec.kind, p)).collect()
        } else {
            spec.token_types
        };

        let mut piece_to_id = HashMap::with_capacity(n);
        for (id, piece) in spec.tokens.iter().enumerate() {
            // First occurrence wins for duplicated pieces.
            piece_to_id.entry(piece.clone()).or_insert(id as TokenId);
        }

        let mut byte_tokens = vec![None; 256];
        for b in 0..=255u8 {
            let piece = match spec.kind {
                VocabKind::SentencePiece => byte_fallback_piece(b),
                VocabKind::BytePairBpe => byte_level_char(b).to_string(),
            };
            byte_tokens[b as usize] = piece_to_id.get(&piece).copied();
        }

        let mut merge_ranks = HashMap::with_capacity(spec.merges.len());
        for (rank, rule) in spec.merges.iter().enumerate() {
            let (left, right) = rule.split_once(' ').ok_or_else(|| {
                TokenizerError::InvalidVocab(format!("malformed merge rule: {rule:?}"))
            })?;
            merge_ranks
                .entry((left.to_string(), right.to_string()))
                .or_insert(rank);
        }

        let char_to_byte = (0..=255u8).map(|b| (byte_level_char(b), b)).collect();

        let specials = SpecialMatcher::new(
            spec.tokens
                .iter()
                .zip(&types)
                .enumerate()
                .filter(|(_, (_, ty))| ty.is_special())
                .map(|(id, (piece, _))| (piece.clone(), id as TokenId)),
        );

        Ok(Self {
            kind: spec.kind,
            pieces: spec.tokens,
            types,
            scores: spec.scores,
            piece_to_id,
            merge_ranks,
            byte_tokens,
            char_to_byte,
            specials,
            bos: spec.bos,
            eos: spec.eos,
            unk: spec.unk,
        })
    }

    pub fn kind(&self) -> VocabKind {
        self.kind
    }

    pub fn piece(&self, token: TokenId) -> Option<&str> {
        self.pieces.get(token as usize).map(String::as_str)
    }

    pub fn token_type(&self, token: TokenId) -> Option<TokenType> {
        self.types.get(token as usize).copied()
    }

    /// ID of a piece that may take part in subword assembly.
    fn mergeable(&self, piece: &str) -> Option<TokenId> {
        let id = *self.piece_to_id.get(piece)?;
        match self.types[id as usize] {
            TokenType::Normal | TokenType::UserDefined => Some(id),
            _ => None,
        }
    }

    fn byte_token(&self, b: u8) -> TokenizerResult<TokenId> {
        self.byte_tokens[b as usize].or(self.unk).ok_or_else(|| {
            TokenizerError::EncodingError(format!(
                "byte 0x{b:02X} has no token and the vocabulary has no unknown token"
            ))
        })
    }

    fn encode_text(&self, text: &str, out: &mut Vec<TokenId>) -> TokenizerResult<()> {
        match self.kind {
            VocabKind::SentencePiece => self.encode_spm(text, out),
            VocabKind::BytePairBpe => {
                for chunk in pretokenize(text) {
                    self.encode_bpe_chunk(chunk, out)?;
                }
                Ok(())
            }
        }
    }

    /// Greedy highest-score pair merging over characters.
    fn encode_spm(&self, text: &str, out: &mut Vec<TokenId>) -> TokenizerResult<()> {
        let normalized: String = text
            .chars()
            .map(|c| if c == ' ' { SPM_SPACE } else { c })
            .collect();
        let mut symbols: Vec<String> = normalized.chars().map(String::from).collect();

        loop {
            let mut best: Option<(usize, f32)> = None;
            for i in 0..symbols.len().saturating_sub(1) {
                let merged = format!("{}{}", symbols[i], symbols[i + 1]);
                if let Some(id) = self.mergeable(&merged) {
                    let score = self.scores.get(id as usize).copied().unwrap_or(0.0);
                    if best.map_or(true, |(_, s)| score > s) {
                        best = Some((i, score));
                    }
                }
            }
            match best {
                Some((i, _)) => {
                    let right = symbols.remove(i + 1);
                    symbols[i].push_str(&right);
                }
                None => break,
            }
        }

        for symbol in &symbols {
            match self.mergeable(symbol) {
                Some(id) => out.push(id),
                None => {
                    for b in symbol.replace(SPM_SPACE, " ").bytes() {
                        // A lone space may exist only as the ▁ piece.
                        if b == b' ' {
                            if let Some(id) = self.mergeable(&SPM_SPACE.to_string()) {
                                out.push(id);
                                continue;
                            }
                        }
                        out.push(self.byte_token(b)?);
                    }
                }
            }
        }
        Ok(())
    }

    /// Lowest-rank-first merging over the byte-level alphabet.
    fn encode_bpe_chunk(&self, chunk: &str, out: &mut Vec<TokenId>) -> TokenizerResult<()> {
        let mut symbols: Vec<String> = chunk
            .bytes()
            .map(|b| byte_level_char(b).to_string())
            .collect();

        while symbols.len() > 1 {
            let mut best: Option<(usize, usize)> = None;
            for i in 0..symbols.len() - 1 {
                let key = (symbols[i].clone(), symbols[i + 1].clone());
                if let Some(&rank) = self.merge_ranks.get(&key) {
                    if best.map_or(true, |(_, r)| rank < r) {
                        best = Some((i, rank));
                    }
                }
            }
            match best {
                Some((i, _)) => {
                    let right = symbols.remove(i + 1);
                    symbols[i].push_str(&right);
                }
                None => break,
            }
        }

        for symbol in &symbols {
            match self.mergeable(symbol) {
                Some(id) => out.push(id),
                None => {
                    for c in symbol.chars() {
                        let b = self.char_to_byte.get(&c).copied().ok_or_else(|| {
                            TokenizerError::EncodingError(format!("unexpected symbol {c:?}"))
                        })?;
                        out.push(self.byte_token(b)?);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Split text into word-like chunks for BPE: a run of letters, digits or
/// punctuation with at most one leading space, or a run of whitespace.
/// Concatenating the chunks yields the input.
fn pretokenize(text: &str) -> Vec<&str> {
    #[derive(PartialEq)]
    enum Class {
        Letter,
        Digit,
        Space,
        Other,
    }
    fn class(c: char) -> Class {
        if c.is_whitespace() {
            Class::Space
        } else if c.is_alphabetic() {
            Class::Letter
        } else if c.is_numeric() {
            Class::Digit
        } else {
            Class::Other
        }
    }

    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let end_of = |i: usize| chars.get(i).map_or(text.len(), |&(pos, _)| pos);
    let mut chunks = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let start = chars[i].0;
        if class(chars[i].1) == Class::Space {
            let mut j = i;
            while j < chars.len() && class(chars[j].1) == Class::Space {
                j += 1;
            }
            // A final plain space joins the following word.
            if j < chars.len() && chars[j - 1].1 == ' ' {
                if j - 1 > i {
                    chunks.push(&text[start..end_of(j - 1)]);
                }
                i = j - 1;
            } else {
                chunks.push(&text[start..end_of(j)]);
                i = j;
                continue;
            }
        }

        let start = chars[i].0;
        let mut j = i;
        if chars[j].1 == ' ' {
            j += 1;
        }
        let word_class = class(chars[j].1);
        while j < chars.len() && class(chars[j].1) == word_class {
            j += 1;
        }
        chunks.push(&text[start..end_of(j)]);
        i = j;
    }
    chunks
}

impl TokenCodec for VocabTokenizer {
    fn encode(&self, text: &str) -> TokenizerResult<Vec<TokenId>> {
        let mut ids = Vec::with_capacity(text.len() / 2);
        for segment in self.specials.split(text) {
            match segment {
                Segment::Special(id) => ids.push(id),
                Segment::Text(s) => self.encode_text(s, &mut ids)?,
            }
        }
        Ok(ids)
    }

    fn encode_ordinary(&self, text: &str) -> TokenizerResult<Vec<TokenId>> {
        let mut ids = Vec::with_capacity(text.len() / 2);
        self.encode_text(text, &mut ids)?;
        Ok(ids)
    }

    fn token_bytes(&self, token: TokenId) -> TokenizerResult<Vec<u8>> {
        let idx = token as usize;
        let piece = self
            .pieces
            .get(idx)
            .ok_or(TokenizerError::InvalidToken(token))?;
        let bytes = match (self.types[idx], self.kind) {
            (TokenType::Byte, _) => match parse_byte_fallback(piece) {
                Some(b) => vec![b],
                None => piece.as_bytes().to_vec(),
            },
            (TokenType::Control | TokenType::UserDefined | TokenType::Unknown, _) => {
                piece.as_bytes().to_vec()
            }
            (_, VocabKind::SentencePiece) => piece.replace(SPM_SPACE, " ").into_bytes(),
            (_, VocabKind::BytePairBpe) => {
                let mut bytes = Vec::with_capacity(piece.len());
                for c in piece.chars() {
                    match self.char_to_byte.get(&c) {
                        Some(&b) => bytes.push(b),
                        None => {
                            let mut buf = [0u8; 4];
                            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                        }
                    }
                }
                bytes
            }
        };
        Ok(bytes)
    }

    fn vocab_size(&self) -> usize {
        self.pieces.len()
    }

    fn token_id(&self, piece: &str) -> Option<TokenId> {
        self.piece_to_id.get(piece).copied()
    }

    fn bos_token(&self) -> Option<TokenId> {
        self.bos
    }

    fn eos_token(&self) -> Option<TokenId> {
        self.eos
    }
}
