use anyhow::{Context, Result};
use rusqlite::OptionalExtension;
use tracing::{info, warn};

use super::{MirrorStore, SqliteStore};
use crate::pipeline::PriceSettings;

pub const PRO_DELTA: &str = "price_pro_delta";
pub const DEFAULT_DELTA: &str = "price_default_delta";
pub const ZERO_FLOOR: &str = "price_zero_floor";
pub const IGNORE_BELOW: &str = "price_ignore_below";

impl SqliteStore {
    pub async fn read_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            rusqlite::params![key],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("Failed to read setting {}", key))
    }

    pub async fn write_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )
        .with_context(|| format!("Failed to write setting {}", key))?;
        Ok(())
    }

    /// Write config values for settings not yet present. Stored values win,
    /// so edits made at runtime survive a restart.
    pub async fn seed_price_settings(&self, initial: &PriceSettings) -> Result<()> {
        let conn = self.conn.lock().await;
        for (key, value) in settings_pairs(initial) {
            conn.execute(
                "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
                rusqlite::params![key, value],
            )
            .with_context(|| format!("Failed to seed setting {}", key))?;
        }
        info!("Price settings seeded");
        Ok(())
    }
}

fn settings_pairs(s: &PriceSettings) -> [(&'static str, String); 4] {
    [
        (PRO_DELTA, s.pro_delta.to_string()),
        (DEFAULT_DELTA, s.default_delta.to_string()),
        (ZERO_FLOOR, s.zero_floor.to_string()),
        (IGNORE_BELOW, s.ignore_below.to_string()),
    ]
}

/// Read the current price settings. Unparseable stored values fall back to
/// `defaults` with a warning rather than failing the post.
pub async fn load_price_settings(
    store: &dyn MirrorStore,
    defaults: &PriceSettings,
) -> Result<PriceSettings> {
    Ok(PriceSettings {
        pro_delta: read_parsed(store, PRO_DELTA, defaults.pro_delta).await?,
        default_delta: read_parsed(store, DEFAULT_DELTA, defaults.default_delta).await?,
        zero_floor: read_parsed(store, ZERO_FLOOR, defaults.zero_floor).await?,
        ignore_below: read_parsed(store, IGNORE_BELOW, defaults.ignore_below).await?,
    })
}

pub async fn save_price_settings(store: &dyn MirrorStore, settings: &PriceSettings) -> Result<()> {
    for (key, value) in settings_pairs(settings) {
        store.set_setting(key, &value).await?;
    }
    Ok(())
}

async fn read_parsed<T>(store: &dyn MirrorStore, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + ToString,
{
    let raw = store.get_setting(key, &default.to_string()).await?;
    match parse_setting(&raw) {
        Some(v) => Ok(v),
        None => {
            warn!("Setting {} has unparseable value {:?}, using default", key, raw);
            Ok(default)
        }
    }
}

/// Accepts integers written as floats ("2000.0"), as older stores kept them.
fn parse_setting<T: std::str::FromStr>(raw: &str) -> Option<T> {
    let raw = raw.trim();
    raw.parse()
        .ok()
        .or_else(|| raw.strip_suffix(".0").and_then(|r| r.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> PriceSettings {
        PriceSettings {
            pro_delta: 2000,
            default_delta: 1000,
            zero_floor: true,
            ignore_below: 10000,
        }
    }

    #[tokio::test]
    async fn test_defaults_when_empty() {
        let store = SqliteStore::open_in_memory().unwrap();
        let loaded = load_price_settings(&store, &defaults()).await.unwrap();
        assert_eq!(loaded, defaults());
    }

    #[tokio::test]
    async fn test_seed_does_not_overwrite() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.write_setting(PRO_DELTA, "5000").await.unwrap();
        store.seed_price_settings(&defaults()).await.unwrap();

        let loaded = load_price_settings(&store, &defaults()).await.unwrap();
        assert_eq!(loaded.pro_delta, 5000);
        assert_eq!(loaded.default_delta, 1000);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = SqliteStore::open_in_memory().unwrap();
        let changed = PriceSettings {
            pro_delta: 3000,
            default_delta: 1500,
            zero_floor: false,
            ignore_below: 5000,
        };
        save_price_settings(&store, &changed).await.unwrap();
        let loaded = load_price_settings(&store, &defaults()).await.unwrap();
        assert_eq!(loaded, changed);
    }

    #[tokio::test]
    async fn test_read_failure_is_an_error() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.write_setting(PRO_DELTA, "5000").await.unwrap();
        store
            .conn
            .lock()
            .await
            .execute_batch("DROP TABLE settings")
            .unwrap();

        assert!(store.read_setting(PRO_DELTA).await.is_err());
        assert!(load_price_settings(&store, &defaults()).await.is_err());
    }

    #[tokio::test]
    async fn test_float_and_garbage_values() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.write_setting(PRO_DELTA, "2500.0").await.unwrap();
        store.write_setting(DEFAULT_DELTA, "lots").await.unwrap();
        let loaded = load_price_settings(&store, &defaults()).await.unwrap();
        assert_eq!(loaded.pro_delta, 2500);
        assert_eq!(loaded.default_delta, 1000);
    }
}
