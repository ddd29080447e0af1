//! Token counting with the cl100k_base encoding.
//!
//! Used to bound leaf batches and to decide when the root layer switches to
//! deep mode. Counts are approximate for non-OpenAI models, which is fine for
//! sizing decisions.

use once_cell::sync::Lazy;
use tiktoken_rs::{cl100k_base, CoreBPE};

static BPE: Lazy<Option<CoreBPE>> = Lazy::new(|| cl100k_base().ok());

/// Count tokens in `text`. Falls back to a chars/4 estimate if the
/// tokenizer tables cannot be loaded.
pub fn count_tokens(text: &str) -> usize {
    match BPE.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.chars().count().div_ceil(4),
    }
}

/// Truncate `text` to roughly `max_tokens`, cutting on a char boundary.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> &str {
    if count_tokens(text) <= max_tokens {
        return text;
    }
    // 4 chars/token is a conservative upper bound for code and prose.
    let mut end = (max_tokens * 4).min(text.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_are_monotonic_in_length() {
        let short = count_tokens("def a(): return 1");
        let long = count_tokens(&"def a(): return 1\n".repeat(20));
        assert!(short > 0);
        assert!(long > short);
        assert_eq!(count_tokens(""), 0);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "é".repeat(5_000);
        let cut = truncate_to_tokens(&text, 10);
        assert!(cut.len() <= 40);
        assert!(text.starts_with(cut));
    }
}
