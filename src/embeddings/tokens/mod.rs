
use std::borrow::Cow;

/// Estimate token count for provider accounting and input budgeting.
#[inline]
pub fn estimate_token_count(text: &str) -> usize {
    // Rough heuristic: 1 token ≈ 0.75 words for English text
    // Add extra tokens for punctuation and special characters
    let word_count = text.split_whitespace().count();
    let punct_count = text.chars().filter(|c| c.is_ascii_punctuation()).count();

    (punct_count as f64).mul_add(0.1, word_count as f64 / 0.75) as usize
}

/// Deterministically truncate `text` so its estimated token count fits
/// within `max_tokens`. The same input always yields the same prefix, so
/// repeated indexing of oversized content produces identical embeddings.
#[inline]
pub fn truncate_to_token_budget(text: &str, max_tokens: usize) -> Cow<'_, str> {
    if estimate_token_count(text) <= max_tokens {
        return Cow::Borrowed(text);
    }

    // Start from a generous chars-per-token bound, then shrink until the
    // estimate fits. Cuts land on char boundaries, never mid-codepoint.
    let mut keep_chars = max_tokens.saturating_mul(4).max(1);
    loop {
        let end = byte_index_for_chars(text, keep_chars);
        let candidate = text.get(..end).unwrap_or_default();

        if candidate.is_empty() || estimate_token_count(candidate) <= max_tokens {
            return Cow::Borrowed(candidate);
        }

        keep_chars = keep_chars.saturating_sub((keep_chars / 10).max(1));
    }
}

fn byte_index_for_chars(text: &str, count: usize) -> usize {
    text.char_indices().nth(count).map_or(text.len(), |(idx, _)| idx)
}
