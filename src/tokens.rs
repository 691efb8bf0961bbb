//! Token estimation and budget-aware truncation.
//!
//! Every stage of the pipeline sizes its requests with [`TokenEstimator`]
//! rather than a real tokenizer. The estimate is a character-ratio
//! heuristic: linear in the input, no network, no model files. Source code
//! tokenizes denser than prose, so the default ratio is 3 characters per
//! token rather than the 4 usually quoted for English text.
//!
//! Budgets built on top of the estimate are soft limits; configured budgets
//! sit below the hard service limit to absorb estimation error.

use std::borrow::Cow;

/// Characters per estimated token when nothing else is configured.
pub const DEFAULT_CHARS_PER_TOKEN: usize = 3;

/// Approximates the token cost of a text blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenEstimator {
    chars_per_token: usize,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl TokenEstimator {
    /// Create an estimator. A ratio of zero is clamped to one.
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }

    pub fn chars_per_token(&self) -> usize {
        self.chars_per_token
    }

    /// Estimated token count: `ceil(chars / chars_per_token)`.
    ///
    /// Monotonic in the character count; the empty string costs zero.
    pub fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }

    /// Number of characters that fit in `tokens` estimated tokens.
    pub fn max_chars(&self, tokens: usize) -> usize {
        tokens.saturating_mul(self.chars_per_token)
    }

    /// Cut `text` so that it fits `max_tokens`, appending a visible marker.
    ///
    /// Text that already fits is returned borrowed and untouched. Otherwise
    /// the leading characters are kept (cut on a char boundary) and a
    /// `[... truncated ...]` line is appended; the result, marker included,
    /// estimates at or below `max_tokens` unless the budget is smaller than
    /// the marker itself. The output depends only on the input and budget.
    pub fn truncate<'a>(&self, text: &'a str, max_tokens: usize) -> Cow<'a, str> {
        let original = self.estimate(text);
        if original <= max_tokens {
            return Cow::Borrowed(text);
        }

        // The marker quotes the kept size, which is never wider than the
        // budget, so sizing it against the budget is an upper bound.
        let widest = truncation_marker(original, max_tokens);
        let marker_tokens = self.estimate(&widest) + 1;
        let keep_tokens = max_tokens.saturating_sub(marker_tokens);
        let keep_chars = self.max_chars(keep_tokens);

        let cut = text
            .char_indices()
            .nth(keep_chars)
            .map(|(i, _)| i)
            .unwrap_or(text.len());

        let marker = truncation_marker(original, keep_tokens);
        let mut out = String::with_capacity(cut + marker.len() + 1);
        out.push_str(&text[..cut]);
        out.push('\n');
        out.push_str(&marker);
        Cow::Owned(out)
    }
}

fn truncation_marker(original: usize, kept: usize) -> String {
    format!("[... truncated: ~{original} tokens, kept first ~{kept} ...]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_empty_is_zero() {
        assert_eq!(TokenEstimator::default().estimate(""), 0);
    }

    #[test]
    fn estimate_rounds_up() {
        let est = TokenEstimator::new(3);
        assert_eq!(est.estimate("a"), 1);
        assert_eq!(est.estimate("abc"), 1);
        assert_eq!(est.estimate("abcd"), 2);
        assert_eq!(est.estimate(&"x".repeat(30)), 10);
    }

    #[test]
    fn estimate_counts_chars_not_bytes() {
        let est = TokenEstimator::new(1);
        assert_eq!(est.estimate("héllo"), 5);
        assert_eq!(est.estimate("日本語"), 3);
    }

    #[test]
    fn estimate_is_monotonic() {
        let est = TokenEstimator::default();
        let mut last = 0;
        let mut text = String::new();
        for _ in 0..200 {
            text.push('q');
            let now = est.estimate(&text);
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn zero_ratio_is_clamped() {
        let est = TokenEstimator::new(0);
        assert_eq!(est.chars_per_token(), 1);
        assert_eq!(est.estimate("abcd"), 4);
    }

    #[test]
    fn truncate_leaves_fitting_text_alone() {
        let est = TokenEstimator::new(3);
        let text = "fn main() {}";
        let out = est.truncate(text, 100);
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(out, text);
    }

    #[test]
    fn truncate_fits_budget_and_marks() {
        let est = TokenEstimator::new(3);
        let text = "line of code\n".repeat(10_000);
        let out = est.truncate(&text, 200);
        assert!(est.estimate(&out) <= 200, "got {}", est.estimate(&out));
        assert!(out.ends_with("...]"));
        assert!(out.contains("truncated: ~"));
        assert!(text.starts_with(out.lines().next().unwrap()));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let est = TokenEstimator::new(1);
        let text = "é".repeat(500);
        let out = est.truncate(&text, 80);
        assert!(est.estimate(&out) <= 80);
        assert!(out.starts_with('é'));
    }

    #[test]
    fn truncate_is_deterministic() {
        let est = TokenEstimator::new(3);
        let text = "abcdefghij".repeat(1000);
        assert_eq!(est.truncate(&text, 50), est.truncate(&text, 50));
    }

    #[test]
    fn truncate_tiny_budget_keeps_only_marker() {
        let est = TokenEstimator::new(3);
        let text = "z".repeat(10_000);
        let out = est.truncate(&text, 2);
        assert!(out.starts_with('\n'));
        assert!(out.contains("kept first ~0"));
    }
}
