use std::sync::LazyLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Horizontal whitespace only. Newlines are never part of a run.
static HORIZONTAL_WS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t\x{00A0}\x{2007}\x{202F}]+").unwrap());

/// Canonicalize raw post text: NFC form, horizontal whitespace runs collapsed
/// to a single ASCII space, newlines kept as-is. Absent input yields "".
pub fn normalize_text(raw: Option<&str>) -> String {
    let raw = match raw {
        Some(s) => s,
        None => return String::new(),
    };
    let composed: String = raw.nfc().collect();
    HORIZONTAL_WS.replace_all(&composed, " ").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_text_is_empty() {
        assert_eq!(normalize_text(None), "");
        assert_eq!(normalize_text(Some("")), "");
    }

    #[test]
    fn test_collapses_nbsp_and_spaces() {
        let out = normalize_text(Some("iPhone\u{00A0}\u{00A0}15   Pro\t104.000"));
        assert_eq!(out, "iPhone 15 Pro 104.000");
    }

    #[test]
    fn test_newlines_preserved() {
        let out = normalize_text(Some("line one  \n\nline  two\r\n"));
        assert_eq!(out, "line one \n\nline two\r\n");
    }

    #[test]
    fn test_composes_unicode() {
        // "й" as "и" + combining breve
        let out = normalize_text(Some("\u{0438}\u{0306}"));
        assert_eq!(out, "\u{0439}");
    }
}
