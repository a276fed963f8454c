pub mod errors;
pub mod mappings;
pub mod settings;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

pub use errors::{ErrorRecord, StoredError};
pub use mappings::{MessageKind, SourceKey, TargetMapping};

/// Persistence contract the processor depends on.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    async fn get_mapping(&self, source: SourceKey) -> Result<Option<TargetMapping>>;

    /// Insert or update in place; at most one row per source identity.
    async fn upsert_mapping(&self, mapping: &TargetMapping) -> Result<()>;

    async fn get_setting(&self, key: &str, default: &str) -> Result<String>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;

    async fn record_error(&self, record: &ErrorRecord) -> Result<()>;
}

/// Thread-safe SQLite store for mappings, settings and error records
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        // Migrations run on the raw connection before it is wrapped in the Mutex.
        Self::run_migrations(&conn)?;

        info!("Mirror store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS mappings (
                source_channel INTEGER NOT NULL,
                source_message INTEGER NOT NULL,
                target_message INTEGER NOT NULL,
                kind TEXT NOT NULL,
                summary TEXT NOT NULL,
                delivered_text TEXT NOT NULL DEFAULT '',
                processed_at TEXT NOT NULL,
                UNIQUE (source_channel, source_message)
            );

            CREATE INDEX IF NOT EXISTS idx_mappings_processed
                ON mappings(processed_at);

            CREATE TABLE IF NOT EXISTS errors (
                id TEXT PRIMARY KEY,
                source_channel INTEGER NOT NULL,
                source_message INTEGER NOT NULL,
                error_text TEXT NOT NULL,
                trace TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_errors_created
                ON errors(created_at);

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )
        .context("Failed to run migrations")?;

        // Databases created before the full delivered text was stored
        add_column_if_missing(conn, "mappings", "delivered_text", "TEXT NOT NULL DEFAULT ''")?;
        Ok(())
    }
}

fn add_column_if_missing(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", table))
        .with_context(|| format!("Failed to inspect table {}", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    if !columns.iter().any(|c| c == column) {
        conn.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl))
            .with_context(|| format!("Failed to add column {}.{}", table, column))?;
        info!("Added column {}.{}", table, column);
    }
    Ok(())
}

#[async_trait]
impl MirrorStore for SqliteStore {
    async fn get_mapping(&self, source: SourceKey) -> Result<Option<TargetMapping>> {
        self.find_mapping(source).await
    }

    async fn upsert_mapping(&self, mapping: &TargetMapping) -> Result<()> {
        self.save_mapping(mapping).await
    }

    async fn get_setting(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .read_setting(key)
            .await?
            .unwrap_or_else(|| default.to_string()))
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.write_setting(key, value).await
    }

    async fn record_error(&self, record: &ErrorRecord) -> Result<()> {
        self.insert_error(record).await
    }
}
