// src/util.rs — Shared string helpers

/// Cut a string to at most `max_len` bytes on a UTF-8 boundary.
pub fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Owned excerpt for prompts and status output, marked when shortened.
pub fn excerpt(s: &str, max_len: usize) -> String {
    let cut = truncate_str(s, max_len);
    if cut.len() < s.len() {
        format!("{cut}…")
    } else {
        cut.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello world", 5), "hello");
        // é is two bytes; a cut at 4 must not split it
        assert_eq!(truncate_str("café", 4), "caf");
        assert_eq!(truncate_str("hello", 0), "");
    }

    #[test]
    fn test_excerpt_marks_cut() {
        assert_eq!(excerpt("short", 10), "short");
        assert_eq!(excerpt("a long output", 6), "a long…");
        assert_eq!(excerpt("", 3), "");
    }
}
