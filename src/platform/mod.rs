pub mod telegram;

use crate::delivery::Keyboard;
use crate::store::{MessageKind, SourceKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Photo,
    Video,
    Document,
}

impl MediaKind {
    pub fn message_kind(&self) -> MessageKind {
        match self {
            MediaKind::Photo => MessageKind::Photo,
            MediaKind::Video => MessageKind::Video,
            MediaKind::Document => MessageKind::Document,
        }
    }
}

/// Transport-side handle of a media attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub file_id: String,
    pub file_name: Option<String>,
}

/// A post received from a monitored channel. Immutable once received.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePost {
    pub channel: i64,
    pub message: i64,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub media: Option<MediaRef>,
    /// Present only for items of a multi-item post.
    pub group_id: Option<String>,
    pub keyboard: Option<Keyboard>,
    pub is_edit: bool,
    pub is_service: bool,
}

impl SourcePost {
    pub fn key(&self) -> SourceKey {
        SourceKey {
            channel: self.channel,
            message: self.message,
        }
    }

    /// Text for text posts, caption for media posts.
    pub fn body(&self) -> Option<&str> {
        self.text.as_deref().or(self.caption.as_deref())
    }

    /// Text and caption joined, for keyword and premium checks.
    pub fn combined_text(&self) -> String {
        format!(
            "{}\n{}",
            self.text.as_deref().unwrap_or(""),
            self.caption.as_deref().unwrap_or("")
        )
    }

    pub fn message_kind(&self) -> MessageKind {
        match &self.media {
            Some(media) => media.kind.message_kind(),
            None => MessageKind::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post() -> SourcePost {
        SourcePost {
            channel: -100,
            message: 5,
            text: None,
            caption: Some("12.05.2024 iPhone".to_string()),
            media: Some(MediaRef {
                kind: MediaKind::Video,
                file_id: "f1".to_string(),
                file_name: None,
            }),
            group_id: None,
            keyboard: None,
            is_edit: false,
            is_service: false,
        }
    }

    #[test]
    fn test_body_prefers_text() {
        let mut p = post();
        assert_eq!(p.body(), Some("12.05.2024 iPhone"));
        p.text = Some("text".to_string());
        assert_eq!(p.body(), Some("text"));
    }

    #[test]
    fn test_kind_from_media() {
        let mut p = post();
        assert_eq!(p.message_kind(), MessageKind::Video);
        p.media = None;
        assert_eq!(p.message_kind(), MessageKind::Text);
    }
}
