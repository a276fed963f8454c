use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::delivery::TextMode;
use crate::pipeline::{PremiumScope, PriceSettings};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub filters: FiltersConfig,
    #[serde(default)]
    pub scrub: ScrubConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// "html" escapes rewritten text and sends it as HTML; "plain" sends it verbatim.
    #[serde(default)]
    pub text_mode: TextMode,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChannelsConfig {
    /// Numeric chat ids ("-1001234567890") or public usernames ("@channel").
    pub sources: Vec<String>,
    pub target: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PricingConfig {
    #[serde(default = "default_pro_delta")]
    pub pro_delta: i64,
    #[serde(default = "default_default_delta")]
    pub default_delta: i64,
    #[serde(default = "default_true")]
    pub zero_floor: bool,
    #[serde(default = "default_ignore_below")]
    pub ignore_below: i64,
    #[serde(default = "default_premium_marker")]
    pub premium_marker: String,
    #[serde(default)]
    pub premium_scope: PremiumScope,
    #[serde(default = "default_exclusion_keywords")]
    pub exclusion_keywords: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FiltersConfig {
    #[serde(default = "default_true")]
    pub date_required: bool,
    #[serde(default = "default_info_keywords")]
    pub info_keywords: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScrubConfig {
    /// Handle that replaces the triple phone marker, e.g. "@shop_manager".
    #[serde(default)]
    pub contact_handle: Option<String>,
    #[serde(default = "default_promo_markers")]
    pub promo_markers: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    #[serde(default = "default_album_buffer_ms")]
    pub album_buffer_ms: u64,
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default = "default_download_retries")]
    pub download_retries: u32,
    #[serde(default = "default_backfill_limit")]
    pub backfill_limit: usize,
    #[serde(default = "default_rate_limit_margin_ms")]
    pub rate_limit_margin_ms: u64,
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
    #[serde(default = "default_transient_backoff_ms")]
    pub transient_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_mapping_retention")]
    pub mapping_retention: usize,
    #[serde(default = "default_summary_chars")]
    pub summary_chars: usize,
}

/// What to do with a post whose media could not be downloaded.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MediaFallback {
    /// Deliver the rewritten caption as a plain text post.
    #[default]
    TextOnly,
    Skip,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MediaConfig {
    #[serde(default)]
    pub fallback: MediaFallback,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdminConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_admin_bind")]
    pub bind: String,
    #[serde(default = "default_admin_username")]
    pub username: String,
    #[serde(default = "default_admin_password")]
    pub password: String,
}

fn default_true() -> bool {
    true
}

fn default_pro_delta() -> i64 {
    2000
}

fn default_default_delta() -> i64 {
    1000
}

fn default_ignore_below() -> i64 {
    10000
}

fn default_premium_marker() -> String {
    r"(?i)\bpro\b".to_string()
}

fn default_exclusion_keywords() -> Vec<String> {
    [
        "гарант",
        "чехол",
        "стекло",
        "аксессуар",
        "зарядк",
        "доставк",
        "в пути",
        "предзаказ",
        "trade-in",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_info_keywords() -> Vec<String> {
    [
        "официальный аккаунт",
        "отдел продаж",
        "оптовая торговля",
        "гарантийный сервис",
        "ежедневно",
        "г. москва",
        "контак",
        "📟",
        "+7",
        "телефон",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_promo_markers() -> Vec<String> {
    vec!["розыгрыш".to_string(), "подписывайтесь".to_string()]
}

fn default_album_buffer_ms() -> u64 {
    1000
}

fn default_request_delay_ms() -> u64 {
    450
}

fn default_download_retries() -> u32 {
    3
}

fn default_backfill_limit() -> usize {
    50
}

fn default_rate_limit_margin_ms() -> u64 {
    1000
}

fn default_transient_retries() -> u32 {
    3
}

fn default_transient_backoff_ms() -> u64 {
    1000
}

fn default_db_path() -> PathBuf {
    PathBuf::from("mirror.db")
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_mapping_retention() -> usize {
    500
}

fn default_summary_chars() -> usize {
    800
}

fn default_admin_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_admin_username() -> String {
    "admin".to_string()
}

fn default_admin_password() -> String {
    "changeme".to_string()
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            pro_delta: default_pro_delta(),
            default_delta: default_default_delta(),
            zero_floor: true,
            ignore_below: default_ignore_below(),
            premium_marker: default_premium_marker(),
            premium_scope: PremiumScope::default(),
            exclusion_keywords: default_exclusion_keywords(),
        }
    }
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            date_required: true,
            info_keywords: default_info_keywords(),
        }
    }
}

impl Default for ScrubConfig {
    fn default() -> Self {
        Self {
            contact_handle: None,
            promo_markers: default_promo_markers(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            album_buffer_ms: default_album_buffer_ms(),
            request_delay_ms: default_request_delay_ms(),
            download_retries: default_download_retries(),
            backfill_limit: default_backfill_limit(),
            rate_limit_margin_ms: default_rate_limit_margin_ms(),
            transient_retries: default_transient_retries(),
            transient_backoff_ms: default_transient_backoff_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_db_path(),
            download_dir: default_download_dir(),
            mapping_retention: default_mapping_retention(),
            summary_chars: default_summary_chars(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_admin_bind(),
            username: default_admin_username(),
            password: default_admin_password(),
        }
    }
}

impl PricingConfig {
    /// Settings used to seed the store on first start.
    pub fn initial_settings(&self) -> PriceSettings {
        PriceSettings {
            pro_delta: self.pro_delta,
            default_delta: self.default_delta,
            zero_floor: self.zero_floor,
            ignore_below: self.ignore_below,
        }
    }
}

impl TimingConfig {
    pub fn album_buffer(&self) -> Duration {
        Duration::from_millis(self.album_buffer_ms)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = Self::parse(&content)?;

        // Secrets usually come from the environment rather than the file.
        if let Ok(token) = std::env::var("BOT_TOKEN") {
            if !token.is_empty() {
                config.telegram.bot_token = token;
            }
        }
        if config.telegram.bot_token.is_empty() {
            anyhow::bail!("telegram.bot_token is empty and BOT_TOKEN is not set");
        }

        if !config.storage.download_dir.exists() {
            std::fs::create_dir_all(&config.storage.download_dir).with_context(|| {
                format!(
                    "Failed to create download directory: {}",
                    config.storage.download_dir.display()
                )
            })?;
        }

        Ok(config)
    }

    /// Parse and validate config text without touching the filesystem.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;

        if config.channels.sources.iter().all(|s| s.trim().is_empty()) {
            anyhow::bail!("channels.sources must list at least one source channel");
        }
        if config.channels.target.trim().is_empty() {
            anyhow::bail!("channels.target must not be empty");
        }
        regex::Regex::new(&config.pricing.premium_marker).with_context(|| {
            format!(
                "pricing.premium_marker is not a valid pattern: {}",
                config.pricing.premium_marker
            )
        })?;

        Ok(config)
    }
}
