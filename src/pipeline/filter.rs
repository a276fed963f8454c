use std::sync::LazyLock;

use regex::Regex;

/// "dd.mm.yyyy" style prefix; "/" and "-" separators are accepted as well.
static DATE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d{1,2}[./-]\d{1,2}[./-]\d{4}\b").unwrap());

/// Reasons a post is rejected before any rewriting happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NoDatePrefix,
    Informational,
}

#[derive(Debug, Clone)]
pub struct PostFilter {
    date_required: bool,
    /// Lowercased informational keywords.
    info_keywords: Vec<String>,
}

impl PostFilter {
    pub fn new(date_required: bool, info_keywords: &[String]) -> Self {
        Self {
            date_required,
            info_keywords: info_keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// `lead` is the text (or caption when there is no text) of the canonical
    /// item; `combined` is text and caption joined.
    pub fn check(&self, lead: &str, combined: &str) -> Result<(), Rejection> {
        if self.date_required && !starts_with_date(lead) {
            return Err(Rejection::NoDatePrefix);
        }
        if self.is_informational(combined) {
            return Err(Rejection::Informational);
        }
        Ok(())
    }

    pub fn is_informational(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        self.info_keywords.iter().any(|k| lowered.contains(k.as_str()))
    }
}

pub fn starts_with_date(text: &str) -> bool {
    DATE_PREFIX.is_match(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> PostFilter {
        PostFilter::new(
            true,
            &["Отдел продаж".to_string(), "+7".to_string()],
        )
    }

    #[test]
    fn test_date_prefix_formats() {
        assert!(starts_with_date("12.05.2024\niPhone"));
        assert!(starts_with_date("  1/5/2024 прайс"));
        assert!(starts_with_date("01-05-2024"));
        assert!(!starts_with_date("Прайс 12.05.2024"));
        assert!(!starts_with_date("12.05.24"));
    }

    #[test]
    fn test_missing_date_rejected() {
        let f = filter();
        assert_eq!(
            f.check("iPhone 15 Pro 104.000", "iPhone 15 Pro 104.000"),
            Err(Rejection::NoDatePrefix)
        );
    }

    #[test]
    fn test_date_not_required() {
        let f = PostFilter::new(false, &[]);
        assert_eq!(f.check("iPhone", "iPhone"), Ok(()));
    }

    #[test]
    fn test_informational_rejected() {
        let f = filter();
        let text = "12.05.2024\nОТДЕЛ ПРОДАЖ работает ежедневно";
        assert_eq!(f.check(text, text), Err(Rejection::Informational));
        let text = "12.05.2024\niPhone 15 Pro 104.000";
        assert_eq!(f.check(text, text), Ok(()));
    }
}
