//! Token accounting for upstream responses
//!
//! Streaming responses arrive as server-sent events whose JSON payloads carry
//! `"content":"..."` delta fragments. `StreamTokenCounter` scrapes those
//! fragments line by line and feeds them to a tokenizer. Nothing here may
//! fail the stream: undecodable input is logged and skipped.
//!
//! Non-streaming responses report their own `usage.total_tokens`.

use std::sync::LazyLock;

use regex::bytes::Regex;
use tiktoken_rs::CoreBPE;
use tracing::{debug, warn};

static CONTENT_FRAGMENT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#""content":"((?:[^"\\]|\\.)*)""#).ok());

/// Counts tokens in a piece of generated text.
pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> u64;
}

/// Character-ratio tokenizer: `ceil(chars / chars_per_token)`.
#[derive(Debug, Clone, Copy)]
pub struct HeuristicTokenizer {
    chars_per_token: u64,
}

impl HeuristicTokenizer {
    pub fn new(chars_per_token: u64) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Tokenizer for HeuristicTokenizer {
    fn count(&self, text: &str) -> u64 {
        let chars = text.chars().count() as u64;
        chars.div_ceil(self.chars_per_token)
    }
}

/// Byte-pair encoding tokenizer matching the upstream model's vocabulary.
///
/// If the encoding cannot be loaded the tokenizer degrades to a
/// four-characters-per-token estimate instead of failing requests.
pub struct BpeTokenizer {
    bpe: Option<CoreBPE>,
    fallback: HeuristicTokenizer,
}

impl BpeTokenizer {
    /// Tokenizer for an upstream model name such as `gpt-4`.
    pub fn for_model(model: &str) -> Self {
        let bpe = match tiktoken_rs::get_bpe_from_model(model) {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                warn!(model, error = %e, "no BPE encoding for model, estimating token counts");
                None
            }
        };
        Self {
            bpe,
            fallback: HeuristicTokenizer::new(4),
        }
    }

    /// Whether counts come from the real encoding rather than the estimate.
    pub fn is_exact(&self) -> bool {
        self.bpe.is_some()
    }
}

impl Tokenizer for BpeTokenizer {
    fn count(&self, text: &str) -> u64 {
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
            None => self.fallback.count(text),
        }
    }
}

impl<T: Tokenizer + ?Sized> Tokenizer for &T {
    fn count(&self, text: &str) -> u64 {
        (**self).count(text)
    }
}

/// Sum of token counts over a list of words or fragments.
pub fn count_words<T: AsRef<str>>(tokenizer: &dyn Tokenizer, words: &[T]) -> u64 {
    words.iter().map(|w| tokenizer.count(w.as_ref())).sum()
}

/// Incremental token counter for a streamed chat response.
///
/// Bytes are buffered until a newline so a fragment split across two network
/// chunks is still counted once.
pub struct StreamTokenCounter {
    tokenizer: Box<dyn Tokenizer>,
    pending: Vec<u8>,
    total: u64,
}

impl StreamTokenCounter {
    pub fn new(tokenizer: Box<dyn Tokenizer>) -> Self {
        Self {
            tokenizer,
            pending: Vec::new(),
            total: 0,
        }
    }

    /// Feed one chunk of the upstream body.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return;
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        self.scan(&complete);
    }

    /// Flush any buffered partial line and return the final count.
    pub fn finish(&mut self) -> u64 {
        if !self.pending.is_empty() {
            let tail = std::mem::take(&mut self.pending);
            self.scan(&tail);
        }
        self.total
    }

    /// Tokens counted so far (excluding any buffered partial line).
    pub fn total(&self) -> u64 {
        self.total
    }

    fn scan(&mut self, bytes: &[u8]) {
        let Some(pattern) = CONTENT_FRAGMENT.as_ref() else {
            return;
        };
        for caps in pattern.captures_iter(bytes) {
            let Some(raw) = caps.get(1) else { continue };
            match decode_fragment(raw.as_bytes()) {
                Some(text) => self.total += self.tokenizer.count(&text),
                None => debug!(len = raw.len(), "skipping undecodable content fragment"),
            }
        }
    }
}

/// Undo JSON string escaping on a captured fragment.
fn decode_fragment(raw: &[u8]) -> Option<String> {
    let mut quoted = Vec::with_capacity(raw.len() + 2);
    quoted.push(b'"');
    quoted.extend_from_slice(raw);
    quoted.push(b'"');
    serde_json::from_slice::<String>(&quoted).ok()
}

/// `usage.total_tokens` from a non-streamed response body, zero if absent.
pub fn total_tokens_from_body(body: &[u8]) -> u64 {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(value) => value
            .pointer("/usage/total_tokens")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0),
        Err(e) => {
            debug!(error = %e, "response body is not JSON, recording zero tokens");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> StreamTokenCounter {
        StreamTokenCounter::new(Box::new(HeuristicTokenizer::new(4)))
    }

    #[test]
    fn heuristic_rounds_up() {
        let t = HeuristicTokenizer::new(4);
        assert_eq!(t.count(""), 0);
        assert_eq!(t.count("a"), 1);
        assert_eq!(t.count("abcd"), 1);
        assert_eq!(t.count("abcde"), 2);
    }

    #[test]
    fn heuristic_counts_chars_not_bytes() {
        let t = HeuristicTokenizer::new(4);
        assert_eq!(t.count("日本語で"), 1);
    }

    #[test]
    fn bpe_counts_cl100k_tokens() {
        let t = BpeTokenizer::for_model("gpt-4");
        assert!(t.is_exact());
        assert_eq!(t.count(""), 0);
        assert_eq!(t.count("hello"), 1);
        assert_eq!(t.count("hello world"), 2);
    }

    #[test]
    fn bpe_charges_non_latin_text_per_token_not_per_char() {
        let bpe = BpeTokenizer::for_model("gpt-4");
        let heuristic = HeuristicTokenizer::new(4);
        assert!(bpe.count("日本語で") > heuristic.count("日本語で"));
    }

    #[test]
    fn bpe_unknown_model_falls_back_to_estimate() {
        let t = BpeTokenizer::for_model("not-a-model");
        assert!(!t.is_exact());
        assert_eq!(t.count("abcde"), 2);
    }

    #[test]
    fn stream_counts_with_bpe() {
        let tokenizer = BpeTokenizer::for_model("gpt-3.5-turbo");
        let mut c = StreamTokenCounter::new(Box::new(tokenizer));
        c.feed(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"hello\"}}]}\n\n\
              data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n",
        );
        assert_eq!(c.finish(), 2);
    }

    #[test]
    fn count_words_sums_each_entry() {
        let t = HeuristicTokenizer::new(4);
        assert_eq!(count_words(&t, &["hello", "hi", ""]), 3);
    }

    #[test]
    fn stream_counts_every_fragment_in_a_chunk() {
        let mut c = counter();
        c.feed(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n\
              data: {\"choices\":[{\"delta\":{\"content\":\" world!!\"}}]}\n\n",
        );
        // "Hello" = 2, " world!!" = 2
        assert_eq!(c.finish(), 4);
    }

    #[test]
    fn stream_joins_fragment_split_across_chunks() {
        let mut c = counter();
        c.feed(b"data: {\"delta\":{\"cont");
        assert_eq!(c.total(), 0);
        c.feed(b"ent\":\"abcdefgh\"}}\n\n");
        assert_eq!(c.total(), 2);
    }

    #[test]
    fn stream_unescapes_fragments() {
        let mut c = counter();
        // Decodes to `a"b\n` (4 chars) rather than 7 raw bytes.
        c.feed(br#"data: {"content":"a\"b\n"}"#);
        assert_eq!(c.finish(), 1);
    }

    #[test]
    fn stream_skips_malformed_input() {
        let mut c = counter();
        c.feed(b"\xff\xfe garbage\n");
        c.feed(b"data: {\"content\":\"\\uZZZZ\"}\n");
        c.feed(b"data: [DONE]\n\n");
        assert_eq!(c.finish(), 0);
    }

    #[test]
    fn finish_flushes_trailing_partial_line() {
        let mut c = counter();
        c.feed(br#"data: {"content":"abcd"}"#);
        assert_eq!(c.total(), 0);
        assert_eq!(c.finish(), 1);
    }

    #[test]
    fn body_total_tokens() {
        let body = br#"{"id":"x","usage":{"prompt_tokens":5,"completion_tokens":7,"total_tokens":12}}"#;
        assert_eq!(total_tokens_from_body(body), 12);
    }

    #[test]
    fn body_without_usage_is_zero() {
        assert_eq!(total_tokens_from_body(br#"{"id":"x"}"#), 0);
        assert_eq!(total_tokens_from_body(b"not json"), 0);
    }
}
