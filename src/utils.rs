use std::borrow::Cow;

const PREVIEW_CHARS: usize = 200;

fn escape_char(ch: char) -> Option<&'static str> {
    match ch {
        '&' => Some("&amp;"),
        '<' => Some("&lt;"),
        '>' => Some("&gt;"),
        '"' => Some("&quot;"),
        '\'' => Some("&#39;"),
        _ => None,
    }
}

/// Escapes text for Telegram HTML messages, borrowing when nothing changes.
pub fn html_escape(input: &str) -> Cow<'_, str> {
    let Some(first) = input.find(|ch| escape_char(ch).is_some()) else {
        return Cow::Borrowed(input);
    };

    let mut escaped = String::with_capacity(input.len() + 8);
    escaped.push_str(&input[..first]);
    for ch in input[first..].chars() {
        match escape_char(ch) {
            Some(entity) => escaped.push_str(entity),
            None => escaped.push(ch),
        }
    }
    Cow::Owned(escaped)
}

/// Trimmed body cut to a fixed number of characters, "..." marking the cut.
pub fn preview(body: Option<&str>) -> String {
    let body = body.unwrap_or_default().trim();
    if body.chars().count() <= PREVIEW_CHARS {
        return body.to_string();
    }
    let cut: String = body.chars().take(PREVIEW_CHARS).collect();
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_borrows_clean_text() {
        assert!(matches!(html_escape("plain text"), Cow::Borrowed("plain text")));
    }

    #[test]
    fn escape_replaces_markup_after_clean_prefix() {
        assert_eq!(
            html_escape("a < b & \"c\" > 'd'"),
            "a &lt; b &amp; &quot;c&quot; &gt; &#39;d&#39;"
        );
        assert_eq!(html_escape("привет <b>"), "привет &lt;b&gt;");
    }

    #[test]
    fn preview_truncates_long_bodies() {
        let long = "x".repeat(500);
        let p = preview(Some(&long));
        assert_eq!(p.chars().count(), PREVIEW_CHARS + 3);
        assert!(p.ends_with("..."));

        assert_eq!(preview(Some("  short  ")), "short");
        assert_eq!(preview(None), "");
    }
}
