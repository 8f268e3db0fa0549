//! Tokenizer roundtrip, streaming, and chat formatting tests
//!
//! Enforces bit-perfect tokenization:
//! `decode(encode(x)) == x` across ASCII, unicode, whitespace and streaming
//! boundaries. No dummy-prefix space is ever inserted, so there are no
//! whitespace exceptions for text the vocabulary can represent.

use std::sync::Arc;

use scout_engine::Message;
use scout_tokenizer::vocab::{byte_fallback_piece, byte_level_char};
use scout_tokenizer::*;

const CORPUS: &[&str] = &[
    "",
    "a",
    "hello world",
    " leading",
    "trailing ",
    "a  b",
    "\t\ttabs\n\nnewlines\r\n",
    "naïve café — 日本語 🦀",
    "def f(x):\n    return x ** 2\n",
    "print(1/0)",
];

fn bpe_codec() -> VocabTokenizer {
    let mut tokens: Vec<String> = (0..=255u8).map(|b| byte_level_char(b).to_string()).collect();
    let g = byte_level_char(b' ');
    let merges = vec![
        "h e".to_string(),
        "l l".to_string(),
        "he ll".to_string(),
        format!("{g} w"),
        "o r".to_string(),
    ];
    tokens.push("he".to_string());
    tokens.push("ll".to_string());
    tokens.push("hell".to_string());
    tokens.push(format!("{g}w"));
    tokens.push("or".to_string());
    tokens.push("<|im_start|>".to_string());
    tokens.push("<|im_end|>".to_string());
    let mut spec = VocabSpec::new(VocabKind::BytePairBpe, tokens);
    spec.merges = merges;
    spec.eos = Some(262);
    VocabTokenizer::new(spec).unwrap()
}

fn spm_codec() -> VocabTokenizer {
    let mut tokens: Vec<String> = vec!["<unk>".into(), "<s>".into(), "</s>".into()];
    tokens.extend((0..=255u8).map(byte_fallback_piece));
    tokens.extend(["▁", "▁the", "th", "he", "▁t", "e"].map(String::from));
    let mut spec = VocabSpec::new(VocabKind::SentencePiece, tokens);
    spec.bos = Some(1);
    spec.eos = Some(2);
    spec.unk = Some(0);
    VocabTokenizer::new(spec).unwrap()
}

fn codecs() -> Vec<(&'static str, Box<dyn TokenCodec>)> {
    vec![
        ("byte", Box::new(ByteTokenizer::chatml())),
        ("bpe", Box::new(bpe_codec())),
        ("spm", Box::new(spm_codec())),
    ]
}

// ===== Section A: Roundtrip tests =====

#[test]
fn roundtrip_corpus_on_every_codec() {
    for (name, codec) in codecs() {
        for &text in CORPUS {
            let ids = codec.encode(text).expect("encode failed");
            let decoded = codec.decode(&ids).expect("decode failed");
            assert_eq!(decoded, text, "{name}: roundtrip failed for {text:?}");
        }
    }
}

#[test]
fn roundtrip_every_single_byte_char() {
    let codec = bpe_codec();
    for c in (0u8..128).map(char::from) {
        let text = c.to_string();
        let ids = codec.encode(&text).unwrap();
        assert_eq!(codec.decode(&ids).unwrap(), text);
    }
}

#[test]
fn nonempty_input_never_encodes_to_nothing() {
    for (name, codec) in codecs() {
        for &text in CORPUS.iter().filter(|t| !t.is_empty()) {
            assert!(
                !codec.encode(text).unwrap().is_empty(),
                "{name}: {text:?} produced zero tokens"
            );
        }
    }
}

#[test]
fn merges_reduce_token_count() {
    let codec = bpe_codec();
    assert!(codec.encode("hello world").unwrap().len() < "hello world".len());
}

// ===== Section B: Streaming decoding boundary tests =====

#[test]
fn streaming_decode_matches_batch_decode() {
    for (name, codec) in codecs() {
        for &text in CORPUS {
            let ids = codec.encode(text).unwrap();
            let mut state = DecodingState::new();
            let mut streamed = String::new();
            for &id in &ids {
                streamed.push_str(&codec.decode_token(id, &mut state).unwrap());
            }
            streamed.push_str(&state.flush());
            assert_eq!(streamed, text, "{name}: streaming mismatch for {text:?}");
            assert_eq!(state.buffer(), text);
        }
    }
}

#[test]
fn streaming_never_emits_partial_characters() {
    let codec = ByteTokenizer::new();
    let ids = codec.encode("🦀").unwrap();
    assert_eq!(ids.len(), 4);
    let mut state = DecodingState::new();
    let chunks: Vec<String> = ids
        .iter()
        .map(|&id| codec.decode_token(id, &mut state).unwrap())
        .collect();
    assert_eq!(chunks, vec!["", "", "", "🦀"]);
}

#[test]
fn streaming_state_isolation() {
    let codec = ByteTokenizer::new();
    let mut a = DecodingState::new();
    let mut b = DecodingState::new();
    codec.decode_token(b'a' as u32, &mut a).unwrap();
    codec.decode_token(b'x' as u32, &mut b).unwrap();
    assert_eq!(a.buffer(), "a");
    assert_eq!(b.buffer(), "x");
}

// ===== Section C: Determinism =====

#[test]
fn encode_is_deterministic_across_instances() {
    let text = "the quick brown fox";
    assert_eq!(
        bpe_codec().encode(text).unwrap(),
        bpe_codec().encode(text).unwrap()
    );
    assert_eq!(
        spm_codec().encode(text).unwrap(),
        spm_codec().encode(text).unwrap()
    );
}

#[test]
fn byte_codec_and_byte_level_vocab_agree_on_ids() {
    // A byte-level vocabulary written in byte order assigns the same IDs as
    // the reference byte codec.
    let tokens: Vec<String> = (0..=255u8).map(|b| byte_level_char(b).to_string()).collect();
    let vocab = VocabTokenizer::new(VocabSpec::new(VocabKind::BytePairBpe, tokens)).unwrap();
    let byte = ByteTokenizer::new();
    for &text in CORPUS {
        assert_eq!(vocab.encode(text).unwrap(), byte.encode(text).unwrap());
    }
}

// ===== Section D: Error cases =====

#[test]
fn decode_out_of_range_token_errors() {
    for (_, codec) in codecs() {
        let bad = codec.vocab_size() as u32 + 10;
        assert!(matches!(
            codec.decode(&[bad]),
            Err(TokenizerError::InvalidToken(_))
        ));
    }
}

// ===== Section E: Chat formatting over real vocabularies =====

#[test]
fn chatml_prompt_over_bpe_vocab_uses_control_tokens() {
    let codec: Arc<dyn TokenCodec> = Arc::new(bpe_codec());
    let template = TemplateConfig::default().resolve(codec.as_ref()).unwrap();
    assert_eq!(template.name, "chatml");

    let formatter = ChatFormatter::new(codec.clone(), template);
    let msgs = [Message::system("You are concise."), Message::user("2+2?")];
    let tokens = formatter.render(&msgs).unwrap();
    let im_start = codec.token_id("<|im_start|>").unwrap();
    assert_eq!(tokens.iter().filter(|&&t| t == im_start).count(), 3);
    assert_eq!(
        codec.decode(&tokens).unwrap(),
        formatter.render_text(&msgs, true)
    );
}

#[test]
fn scanner_stops_on_marker_split_across_tokens() {
    let codec = ByteTokenizer::new();
    let ids = codec.encode("The answer is 4.\nUser: next").unwrap();
    let mut scanner = StopScanner::new(&["\nUser:"]);
    let mut state = DecodingState::new();
    let mut shown = String::new();
    let mut consumed = 0;
    for &id in &ids {
        consumed += 1;
        let fragment = codec.decode_token(id, &mut state).unwrap();
        match scanner.push(&fragment) {
            ScanOutcome::Continue(text) => shown.push_str(&text),
            ScanOutcome::Stopped { emit, .. } => {
                shown.push_str(&emit);
                break;
            }
        }
    }
    assert_eq!(shown, "The answer is 4.");
    // Halted on the token completing the marker, not at the end of the text.
    assert_eq!(consumed, "The answer is 4.\nUser:".len());
}
