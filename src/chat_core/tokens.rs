//! Token estimation for context window management.
//!
//! Uses a character-based heuristic calibrated for LLM tokenizers: English
//! prose averages ~3.5-4.0 bytes per token, and we divide by 3.2 to err on
//! the side of overestimation. A real tokenizer can replace this by
//! implementing [`TokenCounter`].
//!
//! Every component that touches `total_tokens` must count through the same
//! `TokenCounter` instance, otherwise the running total drifts from the sum of
//! per-message counts.

// ─── Constants ──────────────────────────────────────────────────────────────

/// Average bytes per token for English prose.
const BYTES_PER_TOKEN: f64 = 3.2;

// ─── UTF-8 Safe Truncation ──────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ─── TokenCounter ───────────────────────────────────────────────────────────

/// Deterministic text → token count mapping.
///
/// Implementations must be pure: the same text always yields the same count,
/// and the empty string yields 0.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> u32;
}

/// Default counter: `ceil(bytes / 3.2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count(&self, text: &str) -> u32 {
        estimate_tokens(text)
    }
}

/// Estimate the token count for a string of natural language text.
pub fn estimate_tokens(text: &str) -> u32 {
    let bytes = text.len() as f64;
    (bytes / BYTES_PER_TOKEN).ceil() as u32
}

// ─── Tests ──────────────────────────────────────────────────────────────────
