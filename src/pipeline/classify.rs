use anyhow::{Context, Result};
use regex::Regex;

/// Per-line classification: does the line carry a product price, and is the
/// product a premium variant.
#[derive(Debug, Clone)]
pub struct LineClassifier {
    /// Lowercased exclusion keywords.
    exclusions: Vec<String>,
    premium: Regex,
}

impl LineClassifier {
    pub fn new(exclusion_keywords: &[String], premium_marker: &str) -> Result<Self> {
        let premium = Regex::new(premium_marker)
            .with_context(|| format!("Invalid premium marker pattern: {}", premium_marker))?;
        let exclusions = exclusion_keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Ok(Self {
            exclusions,
            premium,
        })
    }

    /// False when the line mentions any exclusion keyword (warranty,
    /// accessories, shipping status and similar non-product contexts).
    pub fn is_price_line(&self, line: &str) -> bool {
        let lowered = line.to_lowercase();
        !self.exclusions.iter().any(|k| lowered.contains(k.as_str()))
    }

    /// True when the premium marker matches the line as a whole word.
    pub fn is_premium_line(&self, line: &str) -> bool {
        self.premium.is_match(line)
    }

    /// Premium classification of a whole post (used with post-wide scope).
    pub fn is_premium_text(&self, text: &str) -> bool {
        text.lines().any(|line| self.is_premium_line(line))
    }
}
