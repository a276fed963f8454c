use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::mappings::{format_timestamp, parse_timestamp};
use super::{SourceKey, SqliteStore};

/// A per-post failure, written once and never updated.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub source: SourceKey,
    pub error_text: String,
    pub trace: String,
    pub created_at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn from_error(source: SourceKey, err: &anyhow::Error) -> Self {
        Self {
            source,
            error_text: format!("{:#}", err),
            trace: format!("{:?}", err),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredError {
    pub id: String,
    pub source: SourceKey,
    pub error_text: String,
    pub trace: String,
    pub created_at: DateTime<Utc>,
}

impl SqliteStore {
    pub async fn insert_error(&self, record: &ErrorRecord) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO errors (id, source_channel, source_message, error_text, trace, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                &id,
                record.source.channel,
                record.source.message,
                &record.error_text,
                &record.trace,
                format_timestamp(&record.created_at),
            ],
        )
        .context("Failed to record error")?;
        Ok(())
    }

    /// Newest errors first
    pub async fn recent_errors(&self, limit: usize) -> Result<Vec<StoredError>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, source_channel, source_message, error_text, trace, created_at
             FROM errors ORDER BY created_at DESC LIMIT ?1",
        )?;
        let errors = stmt
            .query_map(rusqlite::params![limit as i64], |row| {
                let created_at: String = row.get(5)?;
                Ok(StoredError {
                    id: row.get(0)?,
                    source: SourceKey {
                        channel: row.get(1)?,
                        message: row.get(2)?,
                    },
                    error_text: row.get(3)?,
                    trace: row.get(4)?,
                    created_at: parse_timestamp(5, &created_at)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load recent errors")?;
        Ok(errors)
    }
}
