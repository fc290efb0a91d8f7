use std::borrow::Cow;

/// Remove control characters from provider- or user-supplied text.
///
/// Tab, newline and carriage return survive; everything else below 0x20,
/// DEL, and C1 controls are dropped. Returns `Cow::Borrowed` for clean input.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let is_stripped = |c: char| c.is_control() && !matches!(c, '\t' | '\n' | '\r');

    if !s.chars().any(is_stripped) {
        return Cow::Borrowed(s);
    }
    Cow::Owned(s.chars().filter(|c| !is_stripped(*c)).collect())
}

/// Truncate to at most `max_chars` characters, never splitting a code point.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}

/// Drop `<...>` tags and decode the handful of entities providers emit.
///
/// Not an HTML parser: Guardian `trailText` and NYT abstracts carry at most
/// inline markup like `<strong>` and `&amp;`.
pub fn strip_html_tags(s: &str) -> Cow<'_, str> {
    if !s.contains('<') && !s.contains('&') {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut in_tag = false;
    for c in s.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }

    let decoded = out
        .replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&");
    Cow::Owned(decoded)
}

/// Normalise provider text: strip markup and controls, collapse whitespace,
/// map blank results to `None`.
pub fn clean_text(raw: Option<&str>) -> Option<String> {
    let raw = raw?;
    let without_tags = strip_html_tags(raw);
    let stripped = strip_control_chars(&without_tags);
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_control_chars_borrowed_when_clean() {
        let s = "Plain headline\twith tab\nand newline";
        assert!(matches!(strip_control_chars(s), Cow::Borrowed(_)));
    }

    #[test]
    fn test_strip_control_chars_removes_escapes() {
        assert_eq!(strip_control_chars("a\x1b[31mb\x07c\u{9b}"), "a[31mbc");
        assert_eq!(strip_control_chars("\x00null\x7f"), "null");
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        assert_eq!(truncate_chars("日本語テキスト", 3), "日本語");
        assert_eq!(truncate_chars("", 3), "");
        assert_eq!(truncate_chars("abc", 0), "");
    }

    #[test]
    fn test_strip_html_tags() {
        assert_eq!(
            strip_html_tags("<p>Markets <strong>rally</strong> &amp; recover</p>"),
            "Markets rally & recover"
        );
        assert!(matches!(strip_html_tags("no markup"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_clean_text() {
        assert_eq!(
            clean_text(Some("  <b>Breaking</b>\n\n news  ")).as_deref(),
            Some("Breaking news")
        );
        assert_eq!(clean_text(Some(" <br/> ")), None);
        assert_eq!(clean_text(None), None);
    }
}
