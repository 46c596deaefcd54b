//! Token estimation.
//!
//! The engine never calls a real tokenizer: every stored `token_count` and
//! every budget decision uses the same `⌈chars/4⌉` estimate, so estimates are
//! stable across runs and cheap enough to recompute anywhere.

/// Estimate the token count of a text as `⌈chars/4⌉`.
pub fn estimate_tokens(text: &str) -> i64 {
    (text.chars().count().div_ceil(4)) as i64
}

/// Estimate tokens for a slice of text fragments.
pub fn estimate_tokens_all<'a, I: IntoIterator<Item = &'a str>>(parts: I) -> i64 {
    parts.into_iter().map(estimate_tokens).sum()
}

/// Largest index `<= at` that lies on a char boundary of `s`.
pub(crate) fn floor_char_boundary(s: &str, at: usize) -> usize {
    if at >= s.len() {
        return s.len();
    }
    let mut i = at;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Truncate `s` to at most `max_chars` characters, on a char boundary.
pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_estimate_counts_chars_not_bytes() {
        // Four multi-byte chars estimate as one token.
        assert_eq!(estimate_tokens("αβγδ"), 1);
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }

    #[test]
    fn test_floor_char_boundary() {
        let s = "aé"; // 'é' spans bytes 1..3
        assert_eq!(floor_char_boundary(s, 2), 1);
        assert_eq!(floor_char_boundary(s, 99), s.len());
    }
}
