use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{
    Chat, FileId, InlineKeyboardButton, InlineKeyboardButtonKind, InlineKeyboardMarkup, InputFile,
    InputMedia, InputMediaDocument, InputMediaPhoto, InputMediaVideo, MessageId, ParseMode,
    Recipient, UpdateKind,
};
use teloxide::{ApiError, RequestError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::album::AlbumAggregator;
use crate::delivery::{
    AlbumEntry, ButtonAction, DeliveryError, Envelope, Keyboard, KeyboardButton, LocalMedia,
    TextMode, Transport,
};
use crate::media::MediaFetcher;
use crate::platform::{MediaKind, MediaRef, SourcePost};
use crate::processor::{LogicalPost, Processor};

/// Which chats count as monitored sources: numeric ids or `@username`s.
#[derive(Debug, Clone, Default)]
pub struct ChannelFilter {
    ids: Vec<i64>,
    usernames: Vec<String>,
}

impl ChannelFilter {
    pub fn from_sources(sources: &[String]) -> Self {
        let mut filter = Self::default();
        for source in sources.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            match source.parse::<i64>() {
                Ok(id) => filter.ids.push(id),
                Err(_) => filter
                    .usernames
                    .push(source.trim_start_matches('@').to_lowercase()),
            }
        }
        filter
    }

    pub fn matches(&self, chat_id: i64, username: Option<&str>) -> bool {
        if self.ids.contains(&chat_id) {
            return true;
        }
        match username {
            Some(name) => self.usernames.iter().any(|u| u.eq_ignore_ascii_case(name)),
            None => false,
        }
    }

    pub fn matches_chat(&self, chat: &Chat) -> bool {
        self.matches(chat.id.0, chat.username())
    }
}

/// Convert an incoming channel message into the transport-neutral form.
pub fn to_source_post(msg: &Message, is_edit: bool) -> SourcePost {
    SourcePost {
        channel: msg.chat.id.0,
        message: msg.id.0 as i64,
        text: msg.text().map(str::to_string),
        caption: msg.caption().map(str::to_string),
        media: media_ref(msg),
        group_id: msg.media_group_id().map(|id| format!("{:?}", id)),
        keyboard: msg
            .reply_markup()
            .map(keyboard_from_markup)
            .filter(|kb| !kb.is_empty()),
        is_edit,
        is_service: !matches!(msg.kind, teloxide::types::MessageKind::Common(_)),
    }
}

fn media_ref(msg: &Message) -> Option<MediaRef> {
    if let Some(photo) = msg.photo().and_then(|sizes| sizes.last()) {
        return Some(MediaRef {
            kind: MediaKind::Photo,
            file_id: photo.file.id.0.clone(),
            file_name: None,
        });
    }
    if let Some(video) = msg.video() {
        return Some(MediaRef {
            kind: MediaKind::Video,
            file_id: video.file.id.0.clone(),
            file_name: video.file_name.clone(),
        });
    }
    msg.document().map(|doc| MediaRef {
        kind: MediaKind::Document,
        file_id: doc.file.id.0.clone(),
        file_name: doc.file_name.clone(),
    })
}

/// Url and callback buttons survive; other button kinds have no meaning in
/// the target channel and are dropped.
pub fn keyboard_from_markup(markup: &InlineKeyboardMarkup) -> Keyboard {
    Keyboard {
        rows: markup
            .inline_keyboard
            .iter()
            .map(|row| {
                row.iter()
                    .filter_map(|button| {
                        let action = match &button.kind {
                            InlineKeyboardButtonKind::Url(url) => ButtonAction::Url(url.to_string()),
                            InlineKeyboardButtonKind::CallbackData(data) => {
                                ButtonAction::Callback(data.clone())
                            }
                            _ => return None,
                        };
                        Some(KeyboardButton {
                            text: button.text.clone(),
                            action,
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .filter(|row| !row.is_empty())
            .collect(),
    }
}

pub fn markup_from_keyboard(keyboard: &Keyboard) -> InlineKeyboardMarkup {
    let rows: Vec<Vec<InlineKeyboardButton>> = keyboard
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .filter_map(|button| match &button.action {
                    ButtonAction::Url(raw) => match reqwest::Url::parse(raw) {
                        Ok(url) => Some(InlineKeyboardButton::url(button.text.clone(), url)),
                        Err(e) => {
                            warn!("Dropping button {:?}: bad url {}: {}", button.text, raw, e);
                            None
                        }
                    },
                    ButtonAction::Callback(data) => {
                        Some(InlineKeyboardButton::callback(button.text.clone(), data.clone()))
                    }
                })
                .collect()
        })
        .collect();
    InlineKeyboardMarkup::new(rows)
}

/// Numeric targets are chat ids, anything else a public `@username`.
pub fn recipient(target: &str) -> Recipient {
    let target = target.trim();
    match target.parse::<i64>() {
        Ok(id) => Recipient::Id(ChatId(id)),
        Err(_) => Recipient::ChannelUsername(format!("@{}", target.trim_start_matches('@'))),
    }
}

/// Map the Bot API error onto the delivery error classes.
pub fn classify_error(err: RequestError) -> DeliveryError {
    match err {
        RequestError::RetryAfter(wait) => DeliveryError::RateLimited(wait.duration()),
        RequestError::Network(e) => DeliveryError::Transient(e.to_string()),
        RequestError::Io(e) => DeliveryError::Transient(e.to_string()),
        RequestError::InvalidJson { source, .. } => DeliveryError::Transient(source.to_string()),
        RequestError::Api(ApiError::Unknown(msg)) if is_server_side(&msg) => {
            DeliveryError::Transient(msg)
        }
        other => DeliveryError::Permanent(other.to_string()),
    }
}

fn is_server_side(msg: &str) -> bool {
    let lowered = msg.to_lowercase();
    ["internal server error", "bad gateway", "gateway timeout", "service unavailable"]
        .iter()
        .any(|m| lowered.contains(m))
}

fn parse_mode(mode: TextMode) -> Option<ParseMode> {
    match mode {
        TextMode::Html => Some(ParseMode::Html),
        TextMode::Plain => None,
    }
}

/// Outbound Bot API calls against the target channel.
#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send_text(&self, env: Envelope<'_>, text: &str) -> Result<i64, DeliveryError> {
        let mut req = self.bot.send_message(recipient(env.target), text);
        if let Some(mode) = parse_mode(env.mode) {
            req = req.parse_mode(mode);
        }
        if let Some(kb) = env.keyboard {
            req = req.reply_markup(markup_from_keyboard(kb));
        }
        let msg = req.await.map_err(classify_error)?;
        Ok(msg.id.0 as i64)
    }

    async fn send_photo(&self, env: Envelope<'_>, file: &Path, caption: &str) -> Result<i64, DeliveryError> {
        let mut req = self
            .bot
            .send_photo(recipient(env.target), InputFile::file(file.to_path_buf()));
        if !caption.is_empty() {
            req = req.caption(caption);
        }
        if let Some(mode) = parse_mode(env.mode) {
            req = req.parse_mode(mode);
        }
        if let Some(kb) = env.keyboard {
            req = req.reply_markup(markup_from_keyboard(kb));
        }
        let msg = req.await.map_err(classify_error)?;
        Ok(msg.id.0 as i64)
    }

    async fn send_video(&self, env: Envelope<'_>, file: &Path, caption: &str) -> Result<i64, DeliveryError> {
        let mut req = self
            .bot
            .send_video(recipient(env.target), InputFile::file(file.to_path_buf()));
        if !caption.is_empty() {
            req = req.caption(caption);
        }
        if let Some(mode) = parse_mode(env.mode) {
            req = req.parse_mode(mode);
        }
        if let Some(kb) = env.keyboard {
            req = req.reply_markup(markup_from_keyboard(kb));
        }
        let msg = req.await.map_err(classify_error)?;
        Ok(msg.id.0 as i64)
    }

    async fn send_document(&self, env: Envelope<'_>, file: &Path, caption: &str) -> Result<i64, DeliveryError> {
        let mut req = self
            .bot
            .send_document(recipient(env.target), InputFile::file(file.to_path_buf()));
        if !caption.is_empty() {
            req = req.caption(caption);
        }
        if let Some(mode) = parse_mode(env.mode) {
            req = req.parse_mode(mode);
        }
        if let Some(kb) = env.keyboard {
            req = req.reply_markup(markup_from_keyboard(kb));
        }
        let msg = req.await.map_err(classify_error)?;
        Ok(msg.id.0 as i64)
    }

    async fn send_media_group(&self, env: Envelope<'_>, items: &[AlbumEntry]) -> Result<Vec<i64>, DeliveryError> {
        let mode = parse_mode(env.mode);
        let media: Vec<InputMedia> = items
            .iter()
            .map(|entry| input_media(entry, mode))
            .collect();
        let sent = self
            .bot
            .send_media_group(recipient(env.target), media)
            .await
            .map_err(classify_error)?;
        Ok(sent.iter().map(|m| m.id.0 as i64).collect())
    }

    async fn edit_text(&self, env: Envelope<'_>, message_id: i64, text: &str) -> Result<(), DeliveryError> {
        let mut req = self
            .bot
            .edit_message_text(recipient(env.target), MessageId(message_id as i32), text);
        if let Some(mode) = parse_mode(env.mode) {
            req = req.parse_mode(mode);
        }
        if let Some(kb) = env.keyboard {
            req = req.reply_markup(markup_from_keyboard(kb));
        }
        req.await.map_err(classify_error)?;
        Ok(())
    }

    async fn edit_caption(&self, env: Envelope<'_>, message_id: i64, caption: &str) -> Result<(), DeliveryError> {
        let mut req = self
            .bot
            .edit_message_caption(recipient(env.target), MessageId(message_id as i32))
            .caption(caption);
        if let Some(mode) = parse_mode(env.mode) {
            req = req.parse_mode(mode);
        }
        if let Some(kb) = env.keyboard {
            req = req.reply_markup(markup_from_keyboard(kb));
        }
        req.await.map_err(classify_error)?;
        Ok(())
    }
}

fn input_media(entry: &AlbumEntry, mode: Option<ParseMode>) -> InputMedia {
    let file = InputFile::file(entry.media.path.clone());
    let caption = entry.caption.clone();
    match entry.media.kind {
        MediaKind::Photo => {
            let mut m = InputMediaPhoto::new(file).caption(caption);
            if let Some(mode) = mode {
                m = m.parse_mode(mode);
            }
            InputMedia::Photo(m)
        }
        MediaKind::Video => {
            let mut m = InputMediaVideo::new(file).caption(caption);
            if let Some(mode) = mode {
                m = m.parse_mode(mode);
            }
            InputMedia::Video(m)
        }
        MediaKind::Document => {
            let mut m = InputMediaDocument::new(file).caption(caption);
            if let Some(mode) = mode {
                m = m.parse_mode(mode);
            }
            InputMedia::Document(m)
        }
    }
}

/// Downloads source media through the Bot API file endpoint.
#[derive(Clone)]
pub struct TelegramMediaFetcher {
    bot: Bot,
    dir: PathBuf,
}

impl TelegramMediaFetcher {
    pub fn new(bot: Bot, dir: PathBuf) -> Self {
        Self { bot, dir }
    }

    fn local_path(&self, media: &MediaRef) -> PathBuf {
        let name = match (&media.file_name, media.kind) {
            (Some(name), _) => sanitize_file_name(name),
            (None, MediaKind::Photo) => "photo.jpg".to_string(),
            (None, MediaKind::Video) => "video.mp4".to_string(),
            (None, MediaKind::Document) => "document.bin".to_string(),
        };
        self.dir.join(format!("{}_{}", uuid::Uuid::new_v4(), name))
    }
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '\\' || c.is_control() { '_' } else { c })
        .collect()
}

#[async_trait]
impl MediaFetcher for TelegramMediaFetcher {
    async fn fetch(&self, media: &MediaRef) -> Result<LocalMedia, DeliveryError> {
        let file = self
            .bot
            .get_file(FileId(media.file_id.clone()))
            .await
            .map_err(classify_error)?;

        let path = self.local_path(media);
        let mut dst = tokio::fs::File::create(&path)
            .await
            .map_err(|e| DeliveryError::Permanent(format!("create {}: {}", path.display(), e)))?;

        if let Err(e) = self.bot.download_file(&file.path, &mut dst).await {
            drop(dst);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(DeliveryError::Transient(e.to_string()));
        }

        debug!("Downloaded {} to {}", media.file_id, path.display());
        Ok(LocalMedia {
            kind: media.kind,
            path,
        })
    }
}

/// Pending channel posts the Bot API still holds for this bot, oldest first.
/// Nothing is acknowledged; the live dispatcher sees the same updates again
/// and the mapping check turns them into no-ops.
pub async fn fetch_backlog(bot: &Bot, filter: &ChannelFilter, limit: usize) -> Result<Vec<SourcePost>> {
    let limit = limit.clamp(1, 100) as u8;
    let updates = bot.get_updates().limit(limit).timeout(0).await?;

    let posts: Vec<SourcePost> = updates
        .into_iter()
        .filter_map(|update| match update.kind {
            UpdateKind::ChannelPost(msg) => Some((msg, false)),
            UpdateKind::EditedChannelPost(msg) => Some((msg, true)),
            _ => None,
        })
        .filter(|(msg, _)| filter.matches_chat(&msg.chat))
        .map(|(msg, is_edit)| to_source_post(&msg, is_edit))
        .collect();

    info!("Backlog: {} channel post(s) pending", posts.len());
    Ok(posts)
}

/// Hand a live post to the album buffer or straight to the processor.
pub async fn route(post: SourcePost, processor: &Processor, aggregator: &AlbumAggregator) {
    if post.is_service {
        debug!("Ignoring service message {}", post.key());
        return;
    }
    let post = match (&post.group_id, post.is_edit) {
        (Some(_), false) => match aggregator.push(post).await {
            Ok(()) => return,
            Err(post) => post,
        },
        // An album still buffering has not been mirrored yet; the edit
        // replaces the buffered item instead of looking for a mapping.
        (Some(_), true) => match aggregator.apply_edit(post).await {
            Ok(()) => return,
            Err(post) => post,
        },
        (None, _) => post,
    };
    processor.process(&LogicalPost::single(post)).await;
}

/// Processes flushed albums one at a time until the aggregator goes away.
pub fn spawn_album_consumer(
    processor: Arc<Processor>,
    mut flushed: mpsc::UnboundedReceiver<Vec<SourcePost>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(items) = flushed.recv().await {
            if let Some(post) = LogicalPost::album(items) {
                processor.process(&post).await;
            }
        }
        info!("Album consumer stopped");
    })
}

/// Run the channel listener until shutdown.
pub async fn run(
    bot: Bot,
    processor: Arc<Processor>,
    aggregator: AlbumAggregator,
    filter: Arc<ChannelFilter>,
) -> Result<()> {
    info!("Starting Telegram channel listener...");

    let handler = dptree::entry()
        .branch(
            Update::filter_channel_post()
                .filter(|msg: Message, filter: Arc<ChannelFilter>| filter.matches_chat(&msg.chat))
                .endpoint(handle_channel_post),
        )
        .branch(
            Update::filter_edited_channel_post()
                .filter(|msg: Message, filter: Arc<ChannelFilter>| filter.matches_chat(&msg.chat))
                .endpoint(handle_edited_post),
        );

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![processor, aggregator, filter])
        .default_handler(|upd| async move {
            debug!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("telegram"))
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn handle_channel_post(
    msg: Message,
    processor: Arc<Processor>,
    aggregator: AlbumAggregator,
) -> ResponseResult<()> {
    let post = to_source_post(&msg, false);
    info!("Channel post {}", post.key());
    route(post, &processor, &aggregator).await;
    Ok(())
}

async fn handle_edited_post(
    msg: Message,
    processor: Arc<Processor>,
    aggregator: AlbumAggregator,
) -> ResponseResult<()> {
    let post = to_source_post(&msg, true);
    info!("Edited channel post {}", post.key());
    route(post, &processor, &aggregator).await;
    Ok(())
}
