use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use teloxide::utils::html;
use tracing::{error, info, warn};

use crate::config::{Config, MediaFallback};
use crate::delivery::{
    AlbumEntry, DeliveryError, Envelope, Keyboard, LocalMedia, RateLimitedSender, RetryPolicy,
    TextMode, Transport,
};
use crate::media::{cleanup_files, fetch_with_retries, MediaFetcher};
use crate::pipeline::filter::{PostFilter, Rejection};
use crate::pipeline::{PriceSettings, TextRules};
use crate::platform::{MediaKind, SourcePost};
use crate::store::mappings::truncate_chars;
use crate::store::settings::load_price_settings;
use crate::store::{ErrorRecord, MessageKind, MirrorStore, TargetMapping};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryAction {
    Sent,
    Edited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Service,
    NoDatePrefix,
    Informational,
    EmptyAfterRewrite,
    /// Rewritten text equals what was last delivered.
    Unchanged,
    /// Edit of a non-canonical album item that was never mirrored itself.
    UnmappedAlbumEdit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient delivery error that outlived its retries.
    Transient,
    Permanent,
    MediaFetch,
    Store,
}

/// Result of processing one logical post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostOutcome {
    Delivered {
        target_message: i64,
        action: DeliveryAction,
    },
    Skipped(SkipReason),
    Failed {
        kind: FailureKind,
        detail: String,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackfillReport {
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// One unit of work: a single post or a flushed album. Never empty; the
/// first item is the canonical identity.
#[derive(Debug, Clone)]
pub struct LogicalPost {
    items: Vec<SourcePost>,
}

impl LogicalPost {
    pub fn single(post: SourcePost) -> Self {
        Self { items: vec![post] }
    }

    pub fn album(items: Vec<SourcePost>) -> Option<Self> {
        if items.is_empty() {
            None
        } else {
            Some(Self { items })
        }
    }

    pub fn canonical(&self) -> &SourcePost {
        &self.items[0]
    }

    pub fn items(&self) -> &[SourcePost] {
        &self.items
    }

    fn is_album(&self) -> bool {
        self.items.len() > 1
    }
}

struct Failure {
    kind: FailureKind,
    error: anyhow::Error,
}

impl Failure {
    fn store(error: anyhow::Error) -> Self {
        Self {
            kind: FailureKind::Store,
            error,
        }
    }

    fn delivery(label: &str, err: DeliveryError) -> Self {
        let kind = match err {
            DeliveryError::Permanent(_) => FailureKind::Permanent,
            DeliveryError::Transient(_) | DeliveryError::RateLimited(_) => FailureKind::Transient,
        };
        Self {
            kind,
            error: anyhow::Error::new(err).context(format!("{} failed", label)),
        }
    }
}

/// Rewritten content of a logical post, computed from raw source text.
struct Prepared {
    kind: MessageKind,
    /// Body for text posts and single-media captions, formatted for the text mode.
    body: String,
    /// Caption per album item, formatted for the text mode.
    captions: Vec<String>,
    /// Plain rewritten text of the canonical item. Stored with the mapping
    /// and compared on the next delivery of the same source.
    delivered_text: String,
    /// False when the rewrite left nothing to deliver.
    has_text: bool,
    keyboard: Option<Keyboard>,
}

pub struct Processor {
    store: Arc<dyn MirrorStore>,
    transport: Arc<dyn Transport>,
    fetcher: Arc<dyn MediaFetcher>,
    sender: RateLimitedSender,
    downloads: RateLimitedSender,
    rules: TextRules,
    filter: PostFilter,
    defaults: PriceSettings,
    target: String,
    request_delay: Duration,
    summary_chars: usize,
    media_fallback: MediaFallback,
    text_mode: TextMode,
}

impl Processor {
    pub fn new(
        config: &Config,
        store: Arc<dyn MirrorStore>,
        transport: Arc<dyn Transport>,
        fetcher: Arc<dyn MediaFetcher>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            store,
            transport,
            fetcher,
            sender: RateLimitedSender::new(RetryPolicy::for_delivery(&config.timing)),
            downloads: RateLimitedSender::new(RetryPolicy::for_downloads(&config.timing)),
            rules: TextRules::from_config(&config.pricing, &config.scrub)?,
            filter: PostFilter::new(config.filters.date_required, &config.filters.info_keywords),
            defaults: config.pricing.initial_settings(),
            target: config.channels.target.clone(),
            request_delay: config.timing.request_delay(),
            summary_chars: config.storage.summary_chars,
            media_fallback: config.media.fallback,
            text_mode: config.telegram.text_mode,
        })
    }

    /// Process one logical post start to finish. Failures are recorded
    /// against the canonical identity and never escape.
    pub async fn process(&self, post: &LogicalPost) -> PostOutcome {
        let first = post.canonical();
        let source = first.key();

        match self.process_inner(post).await {
            Ok(outcome) => {
                match &outcome {
                    PostOutcome::Delivered {
                        target_message,
                        action,
                    } => info!("Post {} {:?} as {}", source, action, target_message),
                    PostOutcome::Skipped(reason) => info!("Post {} skipped: {:?}", source, reason),
                    PostOutcome::Failed { .. } => {}
                }
                outcome
            }
            Err(failure) => {
                error!("Post {} failed ({:?}): {:#}", source, failure.kind, failure.error);
                self.record_failure(first, &failure.error).await;
                PostOutcome::Failed {
                    kind: failure.kind,
                    detail: format!("{:#}", failure.error),
                }
            }
        }
    }

    /// Historical posts, strictly one after another with the inter-request
    /// delay between items. Consecutive items of one group form one post.
    pub async fn backfill(&self, posts: Vec<SourcePost>) -> BackfillReport {
        let mut report = BackfillReport::default();
        let batches = group_consecutive(posts);
        let total = batches.len();
        info!("Backfill: {} logical post(s)", total);

        for (i, batch) in batches.iter().enumerate() {
            match self.process(batch).await {
                PostOutcome::Delivered { .. } => report.delivered += 1,
                PostOutcome::Skipped(_) => report.skipped += 1,
                PostOutcome::Failed { .. } => report.failed += 1,
            }
            if i + 1 < total {
                tokio::time::sleep(self.request_delay).await;
            }
        }

        info!(
            "Backfill done: {} delivered, {} skipped, {} failed",
            report.delivered, report.skipped, report.failed
        );
        report
    }

    async fn process_inner(&self, post: &LogicalPost) -> Result<PostOutcome, Failure> {
        let first = post.canonical();
        if first.is_service {
            return Ok(PostOutcome::Skipped(SkipReason::Service));
        }

        let combined = first.combined_text();
        if let Err(rejection) = self.filter.check(first.body().unwrap_or(""), &combined) {
            return Ok(PostOutcome::Skipped(match rejection {
                Rejection::NoDatePrefix => SkipReason::NoDatePrefix,
                Rejection::Informational => SkipReason::Informational,
            }));
        }

        let premium = self.rules.classifier.is_premium_text(&combined);
        let settings = load_price_settings(self.store.as_ref(), &self.defaults)
            .await
            .map_err(Failure::store)?;

        let prepared = self.prepare(post, &settings, premium);
        if !prepared.has_text {
            return Ok(PostOutcome::Skipped(SkipReason::EmptyAfterRewrite));
        }
        let summary = truncate_chars(&prepared.delivered_text, self.summary_chars);

        let existing = self
            .store
            .get_mapping(first.key())
            .await
            .map_err(Failure::store)?;

        let (target_message, kind, action) = match existing {
            Some(mapping) if mapping.is_current(&prepared.delivered_text, &summary) => {
                return Ok(PostOutcome::Skipped(SkipReason::Unchanged));
            }
            Some(mapping) => {
                self.edit(&mapping, &prepared).await?;
                (mapping.target_message, mapping.kind, DeliveryAction::Edited)
            }
            None if first.is_edit && first.group_id.is_some() => {
                return Ok(PostOutcome::Skipped(SkipReason::UnmappedAlbumEdit));
            }
            None => {
                let (id, kind) = self.send(post, &prepared).await?;
                (id, kind, DeliveryAction::Sent)
            }
        };

        self.store
            .upsert_mapping(&TargetMapping {
                source: first.key(),
                target_message,
                kind,
                summary,
                delivered_text: prepared.delivered_text,
                processed_at: Utc::now(),
            })
            .await
            .map_err(Failure::store)?;

        Ok(PostOutcome::Delivered {
            target_message,
            action,
        })
    }

    fn prepare(&self, post: &LogicalPost, settings: &PriceSettings, premium: bool) -> Prepared {
        let keyboard = post
            .canonical()
            .keyboard
            .as_ref()
            .filter(|kb| !kb.is_empty())
            .map(|kb| kb.map_labels(|label| self.rules.rewrite_label(label, settings, premium)));

        if post.is_album() {
            let captions: Vec<String> = post
                .items()
                .iter()
                .map(|item| {
                    self.rules
                        .rewrite_post(item.caption.as_deref(), settings, premium)
                        .text
                })
                .collect();
            // Edits arrive per item and only the first item's caption is
            // ever edited on the mirror, so that caption is the album's text.
            let delivered_text = captions.first().cloned().unwrap_or_default();
            Prepared {
                kind: MessageKind::Album,
                body: self.format(&delivered_text),
                captions: captions.iter().map(|c| self.format(c)).collect(),
                has_text: captions.iter().any(|c| !c.trim().is_empty()),
                delivered_text,
                keyboard,
            }
        } else {
            let first = post.canonical();
            let rewritten = self.rules.rewrite_post(first.body(), settings, premium);
            Prepared {
                kind: first.message_kind(),
                body: self.format(&rewritten.text),
                captions: Vec::new(),
                has_text: !rewritten.text.trim().is_empty(),
                delivered_text: rewritten.text,
                keyboard,
            }
        }
    }

    fn format(&self, text: &str) -> String {
        match self.text_mode {
            TextMode::Html => html::escape(text),
            TextMode::Plain => text.to_string(),
        }
    }

    fn envelope<'a>(&'a self, keyboard: Option<&'a Keyboard>) -> Envelope<'a> {
        Envelope {
            target: &self.target,
            keyboard,
            mode: self.text_mode,
        }
    }

    async fn edit(&self, mapping: &TargetMapping, prepared: &Prepared) -> Result<(), Failure> {
        let env = self.envelope(prepared.keyboard.as_ref());
        let id = mapping.target_message;
        if mapping.kind.has_caption() {
            // Album captions live on the first delivered item.
            let caption = prepared.body.as_str();
            self.sender
                .call("edit_caption", || self.transport.edit_caption(env, id, caption))
                .await
                .map_err(|e| Failure::delivery("edit_caption", e))
        } else {
            let text = prepared.body.as_str();
            self.sender
                .call("edit_text", || self.transport.edit_text(env, id, text))
                .await
                .map_err(|e| Failure::delivery("edit_text", e))
        }
    }

    async fn send(&self, post: &LogicalPost, prepared: &Prepared) -> Result<(i64, MessageKind), Failure> {
        match prepared.kind {
            MessageKind::Text => Ok((self.send_text(prepared).await?, MessageKind::Text)),
            MessageKind::Album => self.send_album(post, prepared).await,
            _ => self.send_single_media(post.canonical(), prepared).await,
        }
    }

    async fn send_text(&self, prepared: &Prepared) -> Result<i64, Failure> {
        let env = self.envelope(prepared.keyboard.as_ref());
        let text = prepared.body.as_str();
        self.sender
            .call("send_text", || self.transport.send_text(env, text))
            .await
            .map_err(|e| Failure::delivery("send_text", e))
    }

    async fn send_single_media(
        &self,
        item: &SourcePost,
        prepared: &Prepared,
    ) -> Result<(i64, MessageKind), Failure> {
        let media = match &item.media {
            Some(media) => media,
            None => return Ok((self.send_text(prepared).await?, MessageKind::Text)),
        };

        let local = match fetch_with_retries(self.fetcher.as_ref(), &self.downloads, media).await {
            Ok(local) => local,
            Err(e) => {
                let err = anyhow::Error::new(e).context(format!(
                    "downloading {:?} {} failed",
                    media.kind, media.file_id
                ));
                return self.media_fallback(item, prepared, err).await;
            }
        };

        let result = self.upload(&local, prepared).await;
        cleanup_files(std::slice::from_ref(&local));
        Ok((result?, local.kind.message_kind()))
    }

    async fn upload(&self, local: &LocalMedia, prepared: &Prepared) -> Result<i64, Failure> {
        let env = self.envelope(prepared.keyboard.as_ref());
        let caption = prepared.body.as_str();
        let path = local.path.as_path();
        let (label, result) = match local.kind {
            MediaKind::Photo => (
                "send_photo",
                self.sender
                    .call("send_photo", || self.transport.send_photo(env, path, caption))
                    .await,
            ),
            MediaKind::Video => (
                "send_video",
                self.sender
                    .call("send_video", || self.transport.send_video(env, path, caption))
                    .await,
            ),
            MediaKind::Document => (
                "send_document",
                self.sender
                    .call("send_document", || self.transport.send_document(env, path, caption))
                    .await,
            ),
        };
        result.map_err(|e| Failure::delivery(label, e))
    }

    async fn send_album(&self, post: &LogicalPost, prepared: &Prepared) -> Result<(i64, MessageKind), Failure> {
        let first = post.canonical();
        let mut entries = Vec::new();
        let mut fetch_errors = Vec::new();

        for (i, item) in post.items().iter().enumerate() {
            let media = match &item.media {
                Some(media) => media,
                None => continue,
            };
            if i > 0 {
                tokio::time::sleep(self.request_delay).await;
            }
            match fetch_with_retries(self.fetcher.as_ref(), &self.downloads, media).await {
                Ok(local) => entries.push(AlbumEntry {
                    media: local,
                    caption: prepared.captions.get(i).cloned().unwrap_or_default(),
                }),
                Err(e) => fetch_errors.push(format!("item {}: {}", item.message, e)),
            }
        }

        if entries.is_empty() {
            let err = anyhow!("no album item could be downloaded: {}", fetch_errors.join("; "));
            return self.media_fallback(first, prepared, err).await;
        }
        if !fetch_errors.is_empty() {
            let err = anyhow!(
                "album delivered without {} item(s): {}",
                fetch_errors.len(),
                fetch_errors.join("; ")
            );
            warn!("Post {}: {:#}", first.key(), err);
            self.record_failure(first, &err).await;
        }

        let files: Vec<LocalMedia> = entries.iter().map(|e| e.media.clone()).collect();
        let result = if entries.len() == 1 {
            // A group needs at least two items; the survivor goes out alone.
            let single = Prepared {
                kind: entries[0].media.kind.message_kind(),
                body: entries[0].caption.clone(),
                captions: Vec::new(),
                delivered_text: String::new(),
                has_text: true,
                keyboard: None,
            };
            self.upload(&entries[0].media, &single)
                .await
                .map(|id| (id, MessageKind::Album))
        } else {
            let env = self.envelope(None);
            let items = entries.as_slice();
            self.sender
                .call("send_media_group", || self.transport.send_media_group(env, items))
                .await
                .map_err(|e| Failure::delivery("send_media_group", e))
                .and_then(|ids| match ids.first() {
                    Some(id) => Ok((*id, MessageKind::Album)),
                    None => Err(Failure::delivery(
                        "send_media_group",
                        DeliveryError::Permanent("empty response".to_string()),
                    )),
                })
        };
        cleanup_files(&files);
        result
    }

    /// Media could not be fetched: deliver text only or give up, per config.
    /// The fetch failure is recorded either way.
    async fn media_fallback(
        &self,
        item: &SourcePost,
        prepared: &Prepared,
        err: anyhow::Error,
    ) -> Result<(i64, MessageKind), Failure> {
        match self.media_fallback {
            MediaFallback::TextOnly => {
                warn!("Post {}: {:#}; sending text only", item.key(), err);
                self.record_failure(item, &err).await;
                let text_only = Prepared {
                    kind: MessageKind::Text,
                    body: prepared.body.clone(),
                    captions: Vec::new(),
                    delivered_text: prepared.delivered_text.clone(),
                    has_text: prepared.has_text,
                    keyboard: prepared.keyboard.clone(),
                };
                Ok((self.send_text(&text_only).await?, MessageKind::Text))
            }
            MediaFallback::Skip => Err(Failure {
                kind: FailureKind::MediaFetch,
                error: err,
            }),
        }
    }

    async fn record_failure(&self, item: &SourcePost, err: &anyhow::Error) {
        let record = ErrorRecord::from_error(item.key(), err);
        if let Err(e) = self.store.record_error(&record).await {
            error!("Failed to record error for {}: {:#}", item.key(), e);
        }
    }
}

/// Split a sequence of posts into logical posts: consecutive non-edit items
/// of the same channel sharing a group id form one album.
pub fn group_consecutive(posts: Vec<SourcePost>) -> Vec<LogicalPost> {
    let mut out: Vec<LogicalPost> = Vec::new();
    for post in posts {
        let joins_previous = match (out.last(), &post.group_id) {
            (Some(prev), Some(group)) if !post.is_edit => {
                let head = prev.canonical();
                !head.is_edit && head.channel == post.channel && head.group_id.as_ref() == Some(group)
            }
            _ => false,
        };
        match out.last_mut() {
            Some(prev) if joins_previous => prev.items.push(post),
            _ => out.push(LogicalPost::single(post)),
        }
    }
    out
}
