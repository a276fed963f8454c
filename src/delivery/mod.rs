pub mod sender;

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::platform::MediaKind;

pub use sender::{RateLimitedSender, RetryPolicy};

/// Outcome classes every outbound primitive reports, independent of the
/// transport library underneath.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The provider mandates waiting this long before the next call.
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),
    #[error("transient delivery error: {0}")]
    Transient(String),
    #[error("permanent delivery error: {0}")]
    Permanent(String),
}

/// Rich-text mode the delivered text is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextMode {
    #[default]
    Html,
    Plain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ButtonAction {
    Url(String),
    Callback(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyboardButton {
    pub text: String,
    pub action: ButtonAction,
}

/// Inline keyboard attached under a post.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Keyboard {
    pub rows: Vec<Vec<KeyboardButton>>,
}

impl Keyboard {
    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(|row| row.is_empty())
    }

    /// Same layout with every label passed through `f`.
    pub fn map_labels(&self, mut f: impl FnMut(&str) -> String) -> Keyboard {
        Keyboard {
            rows: self
                .rows
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|b| KeyboardButton {
                            text: f(&b.text),
                            action: b.action.clone(),
                        })
                        .collect()
                })
                .collect(),
        }
    }
}

/// Addressing and presentation shared by every outbound call.
#[derive(Debug, Clone, Copy)]
pub struct Envelope<'a> {
    pub target: &'a str,
    pub keyboard: Option<&'a Keyboard>,
    pub mode: TextMode,
}

/// A downloaded media file ready to be uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    pub kind: MediaKind,
    pub path: PathBuf,
}

/// One item of a grouped-media send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumEntry {
    pub media: LocalMedia,
    pub caption: String,
}

/// Outbound capabilities of the channel transport. Message ids are the
/// target channel's ids.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_text(&self, env: Envelope<'_>, text: &str) -> Result<i64, DeliveryError>;

    async fn send_photo(&self, env: Envelope<'_>, file: &Path, caption: &str) -> Result<i64, DeliveryError>;

    async fn send_video(&self, env: Envelope<'_>, file: &Path, caption: &str) -> Result<i64, DeliveryError>;

    async fn send_document(&self, env: Envelope<'_>, file: &Path, caption: &str) -> Result<i64, DeliveryError>;

    /// Returns the ids of all delivered items, first item first. Media groups
    /// carry no keyboard.
    async fn send_media_group(&self, env: Envelope<'_>, items: &[AlbumEntry]) -> Result<Vec<i64>, DeliveryError>;

    async fn edit_text(&self, env: Envelope<'_>, message_id: i64, text: &str) -> Result<(), DeliveryError>;

    async fn edit_caption(&self, env: Envelope<'_>, message_id: i64, caption: &str) -> Result<(), DeliveryError>;
}
