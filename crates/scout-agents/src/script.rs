//! Script extraction and the coding persona.

use scout_tokenizer::SystemPreamble;

use crate::executor::ExecutorConfig;

const FENCE: &str = "```";
const PYTHON_TAGS: &[&str] = &["python", "py", "python3"];

/// Source of the first Python (or untagged) fenced block in `text`.
///
/// Blocks tagged with another language are skipped. A fence left open at
/// the end of the text (e.g. generation hit its token limit) still yields
/// the lines after it.
pub fn extract_script(text: &str) -> Option<String> {
    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        let Some(info) = line.trim_start().strip_prefix(FENCE) else {
            continue;
        };
        let tag = info.trim().to_ascii_lowercase();
        let wanted = tag.is_empty() || PYTHON_TAGS.contains(&tag.as_str());

        let mut body = Vec::new();
        for line in lines.by_ref() {
            if line.trim() == FENCE {
                break;
            }
            body.push(line);
        }
        if wanted {
            let source = body.join("\n");
            if !source.trim().is_empty() {
                return Some(source);
            }
        }
    }
    None
}

/// `stdout` without its continuation sentinel, or `None` unless the last
/// non-blank line is exactly the sentinel (surrounding whitespace aside).
pub fn strip_sentinel<'a>(stdout: &'a str, sentinel: &str) -> Option<&'a str> {
    let sentinel = sentinel.trim();
    if sentinel.is_empty() {
        return None;
    }
    let body = stdout.trim_end();
    let (before, last) = match body.rfind('\n') {
        Some(i) => (&body[..i], &body[i + 1..]),
        None => ("", body),
    };
    (last.trim() == sentinel).then(|| before.trim_end())
}

/// System preamble for the autonomous coding loop. The conversation's own
/// system message, if any, follows the instructions.
pub fn coding_preamble(config: &ExecutorConfig) -> SystemPreamble {
    let instructions = format!(
        "You are a coding assistant that solves tasks by writing Python.\n\
         Reply with exactly one fenced ```python code block. It will be executed \
         and its standard output shown to the user.\n\
         If you need to see intermediate data before giving a final answer, print \
         it and print {sentinel} as the very last line; the output will come back \
         to you as \"{output}<output>\".\n\
         If the script raises, you will receive \"{exception}<traceback>\"; reply \
         with a corrected script.\n\
         If no code is needed, answer in plain text without a code block.",
        sentinel = config.continuation_sentinel,
        output = config.output_prefix,
        exception = config.exception_prefix,
    );
    SystemPreamble::prepend(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_python_block() {
        let text = "Here you go:\n```python\nprint(1/0)\n```\nDone.";
        assert_eq!(extract_script(text).as_deref(), Some("print(1/0)"));
    }

    #[test]
    fn accepts_py_and_untagged_fences() {
        assert_eq!(extract_script("```py\nx = 1\n```").as_deref(), Some("x = 1"));
        assert_eq!(
            extract_script("```\nprint('a')\nprint('b')\n```").as_deref(),
            Some("print('a')\nprint('b')")
        );
    }

    #[test]
    fn skips_other_languages() {
        let text = "```bash\nrm -rf /\n```\n```python\nprint(2)\n```";
        assert_eq!(extract_script(text).as_deref(), Some("print(2)"));
        assert_eq!(extract_script("```rust\nfn main() {}\n```"), None);
    }

    #[test]
    fn plain_text_has_no_script() {
        assert_eq!(extract_script("The answer is 4."), None);
        assert_eq!(extract_script("```python\n\n```"), None);
    }

    #[test]
    fn unterminated_fence_yields_remaining_lines() {
        assert_eq!(
            extract_script("```python\nprint(3)").as_deref(),
            Some("print(3)")
        );
    }

    #[test]
    fn sentinel_is_stripped_from_the_end_only() {
        assert_eq!(strip_sentinel("42\nCONTINUE\n", "CONTINUE"), Some("42"));
        assert_eq!(strip_sentinel("CONTINUE then 42\n", "CONTINUE"), None);
        assert_eq!(strip_sentinel("CONTINUE", "CONTINUE"), Some(""));
        assert_eq!(strip_sentinel("42", ""), None);
    }

    #[test]
    fn sentinel_must_be_a_whole_line() {
        assert_eq!(strip_sentinel("DISCONTINUE", "CONTINUE"), None);
        assert_eq!(strip_sentinel("42\nplease CONTINUE\n", "CONTINUE"), None);
        assert_eq!(strip_sentinel("42\nCONTINUED", "CONTINUE"), None);
        assert_eq!(strip_sentinel("a\r\nb\r\n  CONTINUE \r\n", "CONTINUE"), Some("a\r\nb"));
        assert_eq!(strip_sentinel("42\nCONTINUE\n\n", "CONTINUE"), Some("42"));
    }

    #[test]
    fn preamble_mentions_protocol_markers() {
        let config = ExecutorConfig::default();
        let text = coding_preamble(&config).produce(None).unwrap();
        assert!(text.contains("CONTINUE"));
        assert!(text.contains("PREVIOUS SCRIPT EXCEPTION: "));
        assert!(text.contains("LAST SCRIPT OUTPUT: "));
    }
}
