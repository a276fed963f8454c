pub mod classify;
pub mod filter;
pub mod normalize;
pub mod price;
pub mod scrub;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::PricingConfig;
use crate::config::ScrubConfig;
use classify::LineClassifier;
use price::{PriceRewriter, Rewritten};
use scrub::ContentScrubber;

/// Runtime-mutable price parameters, read fresh for every post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSettings {
    pub pro_delta: i64,
    pub default_delta: i64,
    pub zero_floor: bool,
    pub ignore_below: i64,
}

/// Whether the premium delta is chosen per line or for the whole post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PremiumScope {
    #[default]
    Line,
    Post,
}

/// The static part of the text pipeline, built once from config.
#[derive(Debug, Clone)]
pub struct TextRules {
    pub classifier: LineClassifier,
    pub scrubber: ContentScrubber,
    pub scope: PremiumScope,
}

impl TextRules {
    pub fn from_config(pricing: &PricingConfig, scrub: &ScrubConfig) -> Result<Self> {
        Ok(Self {
            classifier: LineClassifier::new(&pricing.exclusion_keywords, &pricing.premium_marker)?,
            scrubber: ContentScrubber::new(scrub.contact_handle.clone(), &scrub.promo_markers),
            scope: pricing.premium_scope,
        })
    }

    /// Normalize, scrub and reprice one block of source text. Always takes
    /// the raw source text; never feed it previously delivered output.
    pub fn rewrite_post(
        &self,
        raw: Option<&str>,
        settings: &PriceSettings,
        post_premium: bool,
    ) -> Rewritten {
        let normalized = normalize::normalize_text(raw);
        let scrubbed = self.scrubber.scrub(&normalized);
        self.rewriter(settings, post_premium).rewrite(&scrubbed)
    }

    /// Reprice a short label (keyboard button text), no scrubbing.
    pub fn rewrite_label(&self, label: &str, settings: &PriceSettings, post_premium: bool) -> String {
        let normalized = normalize::normalize_text(Some(label));
        self.rewriter(settings, post_premium).rewrite(&normalized).text
    }

    fn rewriter<'a>(&'a self, settings: &'a PriceSettings, post_premium: bool) -> PriceRewriter<'a> {
        let forced = self.scope == PremiumScope::Post && post_premium;
        PriceRewriter::new(&self.classifier, settings).with_post_premium(forced)
    }
}
