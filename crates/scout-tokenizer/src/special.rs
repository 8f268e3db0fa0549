//! Literal matching of special tokens ahead of subword encoding.

use scout_engine::TokenId;

/// A run of input text, or a special token found in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    Special(TokenId),
}

/// Splits text around literal occurrences of special token pieces.
/// At any position the longest matching piece wins.
#[derive(Debug, Clone, Default)]
pub struct SpecialMatcher {
    // Sorted longest first.
    pieces: Vec<(String, TokenId)>,
}

impl SpecialMatcher {
    pub fn new(pieces: impl IntoIterator<Item = (String, TokenId)>) -> Self {
        let mut pieces: Vec<(String, TokenId)> =
            pieces.into_iter().filter(|(p, _)| !p.is_empty()).collect();
        pieces.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.1.cmp(&b.1)));
        Self { pieces }
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    fn match_at(&self, rest: &str) -> Option<(usize, TokenId)> {
        self.pieces
            .iter()
            .find(|(piece, _)| rest.starts_with(piece.as_str()))
            .map(|(piece, id)| (piece.len(), *id))
    }

    pub fn split<'a>(&self, text: &'a str) -> Vec<Segment<'a>> {
        if self.pieces.is_empty() {
            return if text.is_empty() {
                Vec::new()
            } else {
                vec![Segment::Text(text)]
            };
        }

        let mut segments = Vec::new();
        let mut text_start = 0;
        let mut pos = 0;
        while pos < text.len() {
            if let Some((len, id)) = self.match_at(&text[pos..]) {
                if text_start < pos {
                    segments.push(Segment::Text(&text[text_start..pos]));
                }
                segments.push(Segment::Special(id));
                pos += len;
                text_start = pos;
            } else {
                // Advance one character.
                pos += text[pos..].chars().next().map_or(1, char::len_utf8);
            }
        }
        if text_start < text.len() {
            segments.push(Segment::Text(&text[text_start..]));
        }
        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_piece_wins() {
        let matcher = SpecialMatcher::new([("<|a|>".to_string(), 1), ("<|a|>x".to_string(), 2)]);
        assert_eq!(
            matcher.split("<|a|>xy"),
            vec![Segment::Special(2), Segment::Text("y")]
        );
    }

    #[test]
    fn text_between_specials_is_preserved() {
        let matcher = SpecialMatcher::new([("<s>".to_string(), 0)]);
        assert_eq!(
            matcher.split("a<s>bé<s>"),
            vec![
                Segment::Text("a"),
                Segment::Special(0),
                Segment::Text("bé"),
                Segment::Special(0),
            ]
        );
    }

    #[test]
    fn empty_matcher_passes_text_through() {
        let matcher = SpecialMatcher::default();
        assert_eq!(matcher.split("abc"), vec![Segment::Text("abc")]);
        assert!(matcher.split("").is_empty());
    }
}
