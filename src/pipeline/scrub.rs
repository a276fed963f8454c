const PHONE_GLYPH: &str = "📞";
const PHONE_MARKER: &str = "📞📞📞";

/// Non-price cleanup applied to the whole post.
#[derive(Debug, Clone, Default)]
pub struct ContentScrubber {
    contact_handle: Option<String>,
    /// Lowercased promo markers.
    promo_markers: Vec<String>,
}

impl ContentScrubber {
    pub fn new(contact_handle: Option<String>, promo_markers: &[String]) -> Self {
        Self {
            contact_handle: contact_handle.filter(|h| !h.trim().is_empty()),
            promo_markers: promo_markers
                .iter()
                .map(|m| m.trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    pub fn scrub(&self, text: &str) -> String {
        let text = self.replace_phone_marker(text);
        self.strip_promo_paragraphs(&text)
    }

    /// "📞📞📞" becomes one glyph followed by the contact handle.
    pub fn replace_phone_marker(&self, text: &str) -> String {
        let replacement = match &self.contact_handle {
            Some(handle) => format!("{} {}", PHONE_GLYPH, handle),
            None => PHONE_GLYPH.to_string(),
        };
        text.replace(PHONE_MARKER, &replacement)
    }

    /// Drop every paragraph that starts at a line containing a promo marker.
    /// The removed span runs through the next blank line inclusive, or to the
    /// end of the text.
    pub fn strip_promo_paragraphs(&self, text: &str) -> String {
        if self.promo_markers.is_empty() {
            return text.to_string();
        }

        let mut kept: Vec<&str> = Vec::new();
        let mut skipping = false;
        for line in text.split('\n') {
            if skipping {
                if line.trim().is_empty() {
                    skipping = false;
                }
                continue;
            }
            if self.is_promo_line(line) {
                skipping = true;
                continue;
            }
            kept.push(line);
        }
        kept.join("\n")
    }

    fn is_promo_line(&self, line: &str) -> bool {
        let lowered = line.to_lowercase();
        self.promo_markers.iter().any(|m| lowered.contains(m.as_str()))
    }
}
