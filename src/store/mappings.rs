use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use super::SqliteStore;

/// Identity of a source post: (channel, message).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SourceKey {
    pub channel: i64,
    pub message: i64,
}

impl std::fmt::Display for SourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.channel, self.message)
    }
}

/// Kind of the mirrored message; decides which edit primitive applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Photo,
    Video,
    Document,
    Album,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Photo => "photo",
            MessageKind::Video => "video",
            MessageKind::Document => "document",
            MessageKind::Album => "album",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "photo" => Some(MessageKind::Photo),
            "video" => Some(MessageKind::Video),
            "document" => Some(MessageKind::Document),
            "album" => Some(MessageKind::Album),
            _ => None,
        }
    }

    /// Edits of everything but plain text go through the caption primitive.
    pub fn has_caption(&self) -> bool {
        !matches!(self, MessageKind::Text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetMapping {
    pub source: SourceKey,
    pub target_message: i64,
    pub kind: MessageKind,
    /// Last delivered text, truncated for display.
    pub summary: String,
    /// Full plain text of the last delivery; decides whether an edit changed anything.
    #[serde(skip)]
    pub delivered_text: String,
    pub processed_at: DateTime<Utc>,
}

impl TargetMapping {
    /// Whether `text` is what this mapping last delivered. Rows written
    /// before the full text was stored only have the truncated summary.
    pub fn is_current(&self, text: &str, summary: &str) -> bool {
        if self.delivered_text.is_empty() {
            self.summary == summary
        } else {
            self.delivered_text == text
        }
    }
}

/// Cut to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

impl SqliteStore {
    pub async fn find_mapping(&self, source: SourceKey) -> Result<Option<TargetMapping>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT source_channel, source_message, target_message, kind, summary, processed_at,
                        delivered_text
                 FROM mappings WHERE source_channel = ?1 AND source_message = ?2",
            )
            .context("Failed to prepare mapping lookup")?;
        let mut rows = stmt
            .query_map(rusqlite::params![source.channel, source.message], parse_mapping_row)
            .context("Failed to query mapping")?;
        match rows.next() {
            Some(Ok(mapping)) => Ok(Some(mapping)),
            Some(Err(e)) => Err(e).context("Failed to read mapping row"),
            None => Ok(None),
        }
    }

    pub async fn save_mapping(&self, mapping: &TargetMapping) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO mappings
             (source_channel, source_message, target_message, kind, summary, processed_at,
              delivered_text)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(source_channel, source_message) DO UPDATE SET
                target_message = excluded.target_message,
                kind = excluded.kind,
                summary = excluded.summary,
                processed_at = excluded.processed_at,
                delivered_text = excluded.delivered_text",
            rusqlite::params![
                mapping.source.channel,
                mapping.source.message,
                mapping.target_message,
                mapping.kind.as_str(),
                &mapping.summary,
                format_timestamp(&mapping.processed_at),
                &mapping.delivered_text,
            ],
        )
        .context("Failed to upsert mapping")?;
        Ok(())
    }

    /// Most recently processed mappings first
    pub async fn recent_mappings(&self, limit: usize) -> Result<Vec<TargetMapping>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT source_channel, source_message, target_message, kind, summary, processed_at,
                        delivered_text
             FROM mappings ORDER BY processed_at DESC LIMIT ?1",
        )?;
        let mappings = stmt
            .query_map(rusqlite::params![limit as i64], parse_mapping_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load recent mappings")?;
        Ok(mappings)
    }

    /// Keep only the newest `keep` mappings. Returns the number of rows removed.
    pub async fn prune_mappings(&self, keep: usize) -> Result<usize> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM mappings WHERE rowid NOT IN (
                    SELECT rowid FROM mappings ORDER BY processed_at DESC LIMIT ?1
                )",
                rusqlite::params![keep as i64],
            )
            .context("Failed to prune mappings")?;
        Ok(removed)
    }
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

#[derive(Debug, thiserror::Error)]
#[error("unknown message kind {0:?}")]
struct UnknownKind(String);

fn parse_mapping_row(row: &rusqlite::Row) -> rusqlite::Result<TargetMapping> {
    let raw_kind: String = row.get(3)?;
    let kind = MessageKind::parse(&raw_kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(UnknownKind(raw_kind.clone())),
        )
    })?;
    let processed_at: String = row.get(5)?;
    Ok(TargetMapping {
        source: SourceKey {
            channel: row.get(0)?,
            message: row.get(1)?,
        },
        target_message: row.get(2)?,
        kind,
        summary: row.get(4)?,
        processed_at: parse_timestamp(5, &processed_at)?,
        delivered_text: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn mapping(message: i64, target: i64, summary: &str) -> TargetMapping {
        TargetMapping {
            source: SourceKey {
                channel: -1001,
                message,
            },
            target_message: target,
            kind: MessageKind::Photo,
            summary: summary.to_string(),
            delivered_text: summary.to_string(),
            processed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_find() {
        let store = SqliteStore::open_in_memory().unwrap();
        let m = mapping(10, 500, "iPhone 15 Pro 102.000");
        store.save_mapping(&m).await.unwrap();

        let found = store.find_mapping(m.source).await.unwrap().unwrap();
        assert_eq!(found.target_message, 500);
        assert_eq!(found.kind, MessageKind::Photo);
        assert_eq!(found.summary, "iPhone 15 Pro 102.000");
    }

    #[tokio::test]
    async fn test_upsert_updates_in_place() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save_mapping(&mapping(10, 500, "old")).await.unwrap();
        store.save_mapping(&mapping(10, 500, "new")).await.unwrap();

        let all = store.recent_mappings(10).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].summary, "new");
    }

    #[tokio::test]
    async fn test_full_text_kept_beside_summary() {
        let store = SqliteStore::open_in_memory().unwrap();
        let full = "12.05.2024\nSamsung S24 Ultra 95.000\niPhone 15 Pro 118.000";
        let mut m = mapping(11, 501, &truncate_chars(full, 20));
        m.delivered_text = full.to_string();
        store.save_mapping(&m).await.unwrap();

        let found = store.find_mapping(m.source).await.unwrap().unwrap();
        assert_eq!(found.summary.chars().count(), 20);
        assert_eq!(found.delivered_text, full);
    }

    #[tokio::test]
    async fn test_unknown_stored_kind_is_an_error() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .conn
            .lock()
            .await
            .execute(
                "INSERT INTO mappings
                 (source_channel, source_message, target_message, kind, summary, processed_at)
                 VALUES (-1001, 12, 600, 'sticker', 'x', '2024-05-12T10:00:00.000Z')",
                [],
            )
            .unwrap();

        let key = SourceKey {
            channel: -1001,
            message: 12,
        };
        let err = store.find_mapping(key).await.unwrap_err();
        assert!(format!("{:#}", err).contains("sticker"));
        assert!(store.recent_mappings(10).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_mapping() {
        let store = SqliteStore::open_in_memory().unwrap();
        let key = SourceKey {
            channel: 1,
            message: 2,
        };
        assert!(store.find_mapping(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prune_keeps_newest() {
        let store = SqliteStore::open_in_memory().unwrap();
        let base = Utc::now();
        for i in 0..5 {
            let mut m = mapping(i, 100 + i, "x");
            m.processed_at = base + Duration::seconds(i);
            store.save_mapping(&m).await.unwrap();
        }

        let removed = store.prune_mappings(2).await.unwrap();
        assert_eq!(removed, 3);

        let left = store.recent_mappings(10).await.unwrap();
        let ids: Vec<i64> = left.iter().map(|m| m.source.message).collect();
        assert_eq!(ids, vec![4, 3]);
    }

    #[test]
    fn test_is_current_compares_full_text() {
        let mut m = mapping(1, 2, "12.05.2024\nSamsung");
        m.delivered_text = "12.05.2024\nSamsung 95.000\niPhone 15 Pro 102.000".to_string();
        assert!(m.is_current("12.05.2024\nSamsung 95.000\niPhone 15 Pro 102.000", "12.05.2024\nSamsung"));
        assert!(!m.is_current("12.05.2024\nSamsung 95.000\niPhone 15 Pro 118.000", "12.05.2024\nSamsung"));

        m.delivered_text.clear();
        assert!(m.is_current("anything", "12.05.2024\nSamsung"));
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("привет", 3), "при");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("", 0), "");
    }

    #[test]
    fn test_kind_round_trip_names() {
        for kind in [
            MessageKind::Text,
            MessageKind::Photo,
            MessageKind::Video,
            MessageKind::Document,
            MessageKind::Album,
        ] {
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
        assert!(!MessageKind::Text.has_caption());
        assert!(MessageKind::Album.has_caption());
    }
}
