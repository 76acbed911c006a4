//! Clause chunking for token streams.
//!
//! Text generators emit tokens far smaller than a useful synthesis request.
//! [`ClauseChunker`] buffers tokens and releases the buffer as soon as it contains
//! a clause or sentence boundary, so speech can start before the full response
//! exists. Bracketed tags such as `[HAPPY]` and `*stage directions*` are stripped
//! before text is released.

use once_cell::sync::Lazy;
use regex::Regex;

static CLAUSE_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"[,.!?]\s").expect("valid regex"));
static SENTENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]$").expect("valid regex"));
static BRACKET_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[.*?\]").expect("valid regex"));
static STAGE_DIRECTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*.*?\*").expect("valid regex"));

/// Remove tags and stage directions, trimming the result.
pub fn sanitize(text: &str) -> String {
    let text = BRACKET_TAG.replace_all(text.trim(), "");
    let text = STAGE_DIRECTION.replace_all(&text, "");
    text.trim().to_string()
}

/// Accumulates tokens and yields speakable clauses.
#[derive(Debug, Default, Clone)]
pub struct ClauseChunker {
    buffer: String,
}

impl ClauseChunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token. Returns a clause once the buffer holds a boundary.
    ///
    /// If the buffer sanitizes to nothing it is kept, so a lone tag is released
    /// together with the text that follows it.
    pub fn push(&mut self, token: &str) -> Option<String> {
        self.buffer.push_str(token);
        if !CLAUSE_BREAK.is_match(&self.buffer) && !SENTENCE_END.is_match(&self.buffer) {
            return None;
        }

        let clause = sanitize(&self.buffer);
        if clause.is_empty() {
            return None;
        }
        self.buffer.clear();
        Some(clause)
    }

    /// Release whatever is left once the token stream ends.
    pub fn finish(&mut self) -> Option<String> {
        let rest = sanitize(&self.buffer);
        self.buffer.clear();
        (!rest.is_empty()).then_some(rest)
    }

    /// Buffered text not yet released.
    pub fn pending(&self) -> &str {
        &self.buffer
    }
}
