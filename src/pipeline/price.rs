use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

use super::classify::LineClassifier;
use super::PriceSettings;

/// Candidate price tokens: separator-grouped integers ("104.000", "1,250,000",
/// optionally "104.000.0") or a bare 5-6 digit run. Digit-adjacency and the
/// space-grouping rule are checked in `accept_token`, since the regex engine
/// has no lookaround.
static PRICE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{1,3}(?:[.,]\d{3})+(?:\.0)?|\d{5,6}").unwrap());

/// A price token found in one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceMatch {
    pub span: Range<usize>,
    pub raw: String,
    pub value: i64,
    pub premium: bool,
    /// None when the token must stay as written.
    pub replacement: Option<i64>,
}

/// Result of rewriting a block of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewritten {
    pub text: String,
    /// Number of tokens whose value changed.
    pub rewrites: usize,
}

impl Rewritten {
    pub fn changed(&self) -> bool {
        self.rewrites > 0
    }
}

pub struct PriceRewriter<'a> {
    classifier: &'a LineClassifier,
    settings: &'a PriceSettings,
    post_premium: bool,
}

impl<'a> PriceRewriter<'a> {
    pub fn new(classifier: &'a LineClassifier, settings: &'a PriceSettings) -> Self {
        Self {
            classifier,
            settings,
            post_premium: false,
        }
    }

    /// Treat every line as premium (post-wide premium scope).
    pub fn with_post_premium(mut self, premium: bool) -> Self {
        self.post_premium = premium;
        self
    }

    /// Rewrite every price-bearing line of `text`. Lines are processed in
    /// isolation and line separators are kept byte-for-byte.
    pub fn rewrite(&self, text: &str) -> Rewritten {
        let mut rewrites = 0;
        let lines: Vec<String> = text
            .split('\n')
            .map(|line| {
                let (out, n) = self.rewrite_line(line);
                rewrites += n;
                out
            })
            .collect();
        Rewritten {
            text: lines.join("\n"),
            rewrites,
        }
    }

    /// Rewrite a single line, returning the new line and the number of
    /// tokens whose value changed.
    pub fn rewrite_line(&self, line: &str) -> (String, usize) {
        if !self.classifier.is_price_line(line) {
            return (line.to_string(), 0);
        }

        let matches = self.find_matches(line);
        if matches.is_empty() {
            return (line.to_string(), 0);
        }

        let mut out = String::with_capacity(line.len());
        let mut cursor = 0;
        let mut changed = 0;
        for m in &matches {
            out.push_str(&line[cursor..m.span.start]);
            match m.replacement {
                Some(new_value) => {
                    if new_value != m.value {
                        changed += 1;
                    }
                    out.push_str(&format_price(new_value));
                }
                None => out.push_str(&m.raw),
            }
            cursor = m.span.end;
        }
        out.push_str(&line[cursor..]);
        (out, changed)
    }

    /// All accepted price tokens of a line, with their computed replacement.
    pub fn find_matches(&self, line: &str) -> Vec<PriceMatch> {
        let premium = self.post_premium || self.classifier.is_premium_line(line);
        let delta = if premium {
            self.settings.pro_delta
        } else {
            self.settings.default_delta
        };

        let mut found = Vec::new();
        let mut pos = 0;
        while pos < line.len() {
            let m = match PRICE_TOKEN.find_at(line, pos) {
                Some(m) => m,
                None => break,
            };
            match accept_token(line, m.start(), m.end()) {
                Some(span) => {
                    let raw = &line[span.clone()];
                    if let Some(value) = parse_price(raw) {
                        found.push(PriceMatch {
                            span: span.clone(),
                            raw: raw.to_string(),
                            value,
                            premium,
                            replacement: compute_replacement(value, delta, self.settings),
                        });
                    }
                    pos = span.end;
                }
                // Tokens are ASCII digits, so start + 1 is a char boundary.
                None => pos = m.start() + 1,
            }
        }
        found
    }
}

/// Boundary rules for a regex hit at `start..end`: no digit directly before
/// or after, and no "digit + whitespace" before (space-grouped numbers such as
/// "17 256" are never prices). A trailing ".0" that runs into more digits is
/// dropped from the token instead of rejecting it.
fn accept_token(line: &str, start: usize, end: usize) -> Option<Range<usize>> {
    let mut before = line[..start].chars().rev();
    match before.next() {
        Some(c) if c.is_ascii_digit() => return None,
        Some(c) if c.is_whitespace() => {
            if before.next().is_some_and(|p| p.is_ascii_digit()) {
                return None;
            }
        }
        _ => {}
    }

    let followed_by_digit = |at: usize| line[at..].chars().next().is_some_and(|c| c.is_ascii_digit());

    if !followed_by_digit(end) {
        return Some(start..end);
    }
    let token = &line[start..end];
    if token.ends_with(".0") && token.len() > 2 && !followed_by_digit(end - 2) {
        return Some(start..end - 2);
    }
    None
}

/// Integer value of a token with grouping punctuation and any ".0" suffix
/// removed. None on overflow.
fn parse_price(raw: &str) -> Option<i64> {
    let body = if raw.contains(['.', ',']) {
        raw.strip_suffix(".0").unwrap_or(raw)
    } else {
        raw
    };
    let digits: String = body.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// New value for a price, or None when the token is kept as written.
pub fn compute_replacement(price: i64, delta: i64, settings: &PriceSettings) -> Option<i64> {
    let candidate = price.checked_sub(delta)?;
    if candidate <= settings.ignore_below {
        return None;
    }
    if settings.zero_floor && candidate < 0 {
        return Some(0);
    }
    Some(candidate)
}

/// Group into 3-digit blocks separated by dots: 102000 -> "102.000".
pub fn format_price(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if value < 0 {
        grouped.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> LineClassifier {
        LineClassifier::new(
            &[
                "гарант".to_string(),
                "чехол".to_string(),
                "доставка".to_string(),
            ],
            r"(?i)\bpro\b",
        )
        .unwrap()
    }

    fn settings() -> PriceSettings {
        PriceSettings {
            pro_delta: 2000,
            default_delta: 1000,
            zero_floor: true,
            ignore_below: 10000,
        }
    }

    fn rewrite(text: &str) -> Rewritten {
        let c = classifier();
        let s = settings();
        PriceRewriter::new(&c, &s).rewrite(text)
    }

    #[test]
    fn test_premium_line_scenario() {
        let out = rewrite("iPhone 15 Pro 104.000");
        assert_eq!(out.text, "iPhone 15 Pro 102.000");
        assert_eq!(out.rewrites, 1);
    }

    #[test]
    fn test_default_delta_for_plain_line() {
        let out = rewrite("Samsung S24 Ultra 95.000");
        assert_eq!(out.text, "Samsung S24 Ultra 94.000");
    }

    #[test]
    fn test_space_grouped_never_matched() {
        let out = rewrite("Чехол 17 256 руб");
        assert_eq!(out.text, "Чехол 17 256 руб");
        assert!(!out.changed());

        // Same rule without an exclusion keyword in play.
        let c = classifier();
        let s = settings();
        let r = PriceRewriter::new(&c, &s);
        assert!(r.find_matches("Model 17 25600 руб").is_empty());
        assert!(r.find_matches("iPhone 17 256.000").is_empty());
        assert_eq!(r.rewrite("Память 17 256 512").text, "Память 17 256 512");
    }

    #[test]
    fn test_number_after_digit_and_space_is_skipped() {
        // "15 104.000" reads as a space-grouped run, so it is left alone.
        assert_eq!(rewrite("iPhone 15 104.000").text, "iPhone 15 104.000");
    }

    #[test]
    fn test_excluded_line_untouched() {
        let out = rewrite("Гарантия 1 год 150.000\nДоставка 25000");
        assert_eq!(out.text, "Гарантия 1 год 150.000\nДоставка 25000");
        assert_eq!(out.rewrites, 0);
    }

    #[test]
    fn test_bare_digit_runs() {
        assert_eq!(rewrite("Pixel 8a 65000").text, "Pixel 8a 64.000");
        assert_eq!(rewrite("Pro Max 165000").text, "Pro Max 163.000");
        // Four and seven digits are not prices.
        assert_eq!(rewrite("Код 4500").text, "Код 4500");
        assert_eq!(rewrite("Артикул 1234567").text, "Артикул 1234567");
    }

    #[test]
    fn test_separators_and_trailing_zero() {
        assert_eq!(rewrite("Watch 45,000").text, "Watch 44.000");
        assert_eq!(rewrite("Watch 45.000.0 руб").text, "Watch 44.000 руб");
        assert_eq!(rewrite("MacBook 1.250.000").text, "MacBook 1.249.000");
    }

    #[test]
    fn test_trailing_zero_running_into_digits() {
        let c = classifier();
        let s = settings();
        let r = PriceRewriter::new(&c, &s);
        let m = r.find_matches("Сумма 45.000.05");
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].raw, "45.000");
    }

    #[test]
    fn test_digit_adjacent_rejected() {
        let c = classifier();
        let s = settings();
        let r = PriceRewriter::new(&c, &s);
        assert!(r.find_matches("SKU1234567890").is_empty());
        assert!(r.find_matches("ref 9999.000").is_empty());
    }

    #[test]
    fn test_ignore_threshold_keeps_token() {
        // 11.000 - 1000 = 10.000 which is <= ignore threshold
        assert_eq!(rewrite("AirPods 11.000").text, "AirPods 11.000");
        assert_eq!(rewrite("AirPods 11.001").text, "AirPods 10.001");
    }

    #[test]
    fn test_zero_floor_clamps() {
        let s = PriceSettings {
            pro_delta: 50000,
            default_delta: 50000,
            zero_floor: true,
            ignore_below: -100000,
        };
        assert_eq!(compute_replacement(20000, 50000, &s), Some(0));

        let unfloored = PriceSettings {
            zero_floor: false,
            ..s
        };
        assert_eq!(compute_replacement(20000, 50000, &unfloored), Some(-30000));
    }

    #[test]
    fn test_replacement_formula_over_range() {
        let s = settings();
        for price in (10_000..200_000).step_by(7_919) {
            for delta in [0, 1000, 2000, 15_000] {
                let expected = if price - delta <= s.ignore_below {
                    None
                } else {
                    Some((price - delta).max(0))
                };
                assert_eq!(compute_replacement(price, delta, &s), expected);
            }
        }
    }

    #[test]
    fn test_lines_processed_independently() {
        let out = rewrite("12.05.2024\niPhone 15 Pro 104.000\niPhone 15 Plus 90.000\n");
        assert_eq!(
            out.text,
            "12.05.2024\niPhone 15 Pro 102.000\niPhone 15 Plus 89.000\n"
        );
        assert_eq!(out.rewrites, 2);
    }

    #[test]
    fn test_post_premium_scope() {
        let c = classifier();
        let s = settings();
        let out = PriceRewriter::new(&c, &s)
            .with_post_premium(true)
            .rewrite("iPhone 15 Plus 90.000");
        assert_eq!(out.text, "iPhone 15 Plus 88.000");
    }

    #[test]
    fn test_rewrite_from_raw_source_is_stable() {
        let raw = "iPhone 15 Pro 104.000";
        let first = rewrite(raw);
        let second = rewrite(raw);
        assert_eq!(first, second);
        // Feeding delivered text back in would subtract twice.
        assert_ne!(rewrite(&first.text).text, first.text);
    }

    #[test]
    fn test_format_price() {
        assert_eq!(format_price(0), "0");
        assert_eq!(format_price(999), "999");
        assert_eq!(format_price(1000), "1.000");
        assert_eq!(format_price(102000), "102.000");
        assert_eq!(format_price(1249000), "1.249.000");
        assert_eq!(format_price(-1500), "-1.500");
    }
}
