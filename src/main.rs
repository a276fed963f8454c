mod admin;
mod album;
mod config;
mod delivery;
mod media;
mod pipeline;
mod platform;
mod processor;
mod scheduler;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use teloxide::Bot;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::AdminState;
use crate::album::AlbumAggregator;
use crate::config::Config;
use crate::platform::telegram::{self, ChannelFilter, TelegramMediaFetcher, TelegramTransport};
use crate::processor::Processor;
use crate::scheduler::MaintenanceScheduler;
use crate::store::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,price_mirror=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Sources: {:?}", config.channels.sources);
    info!("  Target: {}", config.channels.target);
    info!(
        "  Deltas: pro {} / default {}, scope {:?}",
        config.pricing.pro_delta, config.pricing.default_delta, config.pricing.premium_scope
    );
    info!("  Database: {}", config.storage.database_path.display());

    // Store; settings from config only fill in what is not stored yet
    let store = SqliteStore::open(&config.storage.database_path)?;
    store
        .seed_price_settings(&config.pricing.initial_settings())
        .await?;

    let bot = Bot::new(&config.telegram.bot_token);
    let processor = Arc::new(Processor::new(
        &config,
        Arc::new(store.clone()),
        Arc::new(TelegramTransport::new(bot.clone())),
        Arc::new(TelegramMediaFetcher::new(
            bot.clone(),
            config.storage.download_dir.clone(),
        )),
    )?);

    // Background maintenance
    let mut scheduler = MaintenanceScheduler::for_store(store.clone(), &config.storage).await?;
    scheduler.start().await?;

    if config.admin.enabled {
        let state = Arc::new(AdminState {
            store: store.clone(),
            defaults: config.pricing.initial_settings(),
            username: config.admin.username.clone(),
            password: config.admin.password.clone(),
        });
        let admin_config = config.admin.clone();
        tokio::spawn(async move {
            if let Err(e) = admin::serve(&admin_config, state).await {
                error!("Admin API stopped: {:#}", e);
            }
        });
    }

    // Catch up on what arrived while we were offline
    let filter = Arc::new(ChannelFilter::from_sources(&config.channels.sources));
    match telegram::fetch_backlog(&bot, &filter, config.timing.backfill_limit).await {
        Ok(posts) if !posts.is_empty() => {
            processor.backfill(posts).await;
        }
        Ok(_) => info!("Backlog empty"),
        Err(e) => error!("Backfill skipped: {:#}", e),
    }

    // Live mirroring
    let (aggregator, flushed) = AlbumAggregator::new(config.timing.album_buffer());
    let consumer = telegram::spawn_album_consumer(processor.clone(), flushed);

    info!("Price mirror is starting...");
    telegram::run(bot, processor, aggregator.clone(), filter).await?;

    let pending = aggregator.buffered_groups().await;
    if pending > 0 {
        warn!("{} album(s) still buffering at shutdown were dropped", pending);
    }
    consumer.abort();
    scheduler.shutdown().await?;
    info!("Price mirror stopped");
    Ok(())
}
