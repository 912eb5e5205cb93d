/// Truncate `text` to at most `max_bytes`, backing off to a char boundary.
pub fn preview(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Like [`preview`] but yields `None` for empty text.
pub fn non_empty_preview(text: &str, max_bytes: usize) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(preview(text, max_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_respects_char_boundary() {
        // "가" is three bytes
        assert_eq!(preview("가나다", 4), "가");
        assert_eq!(preview("abc", 10), "abc");
        assert_eq!(preview("abcdef", 3), "abc");
    }

    #[test]
    fn test_non_empty_preview() {
        assert_eq!(non_empty_preview("", 10), None);
        assert_eq!(non_empty_preview("error", 2), Some("er".to_string()));
    }
}
