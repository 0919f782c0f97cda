use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, warn};
use warden_core::{ArchivedMessage, ReplyArchivePort, Result, WardenError};

const DEFAULT_RETENTION_DAYS: i64 = 30;
const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// SQLite-backed [`ReplyArchivePort`], keyed by `(channel, chat_id,
/// message_id)`. A single connection behind a mutex, matching this
/// codebase's usual single-writer SQLite wrapper; WAL journaling lets
/// concurrent readers proceed without blocking on the writer.
pub struct SqliteReplyArchive {
    conn: Mutex<Connection>,
    retention_days: i64,
    last_purge: Mutex<Option<Instant>>,
}

impl SqliteReplyArchive {
    pub fn new(conn: Connection, retention_days: i64) -> Self {
        Self {
            conn: Mutex::new(conn),
            retention_days: retention_days.max(1),
            last_purge: Mutex::new(None),
        }
    }

    pub fn open(path: &str, retention_days: i64) -> Result<Self> {
        Ok(Self::new(crate::db::open(path)?, retention_days))
    }

    /// Deletes rows whose `created_at` is older than the retention window.
    /// Returns the number of rows removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let cutoff = (Utc::now() - chrono::Duration::days(self.retention_days)).to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let deleted = conn
            .execute(
                "DELETE FROM inbound_messages WHERE created_at < ?1",
                params![cutoff],
            )
            .map_err(|e| WardenError::Database(e.to_string()))?;
        Ok(deleted)
    }

    fn maybe_purge(&self) {
        let mut last_purge = self.last_purge.lock().unwrap();
        let due = last_purge.map(|t| t.elapsed() >= PURGE_INTERVAL).unwrap_or(true);
        if !due {
            return;
        }
        *last_purge = Some(Instant::now());
        drop(last_purge);

        match self.purge_expired() {
            Ok(0) => {}
            Ok(n) => info!(rows = n, retention_days = self.retention_days, "archive retention purge"),
            Err(e) => warn!(error = %e, "archive retention purge failed"),
        }
    }
}

impl Default for SqliteReplyArchive {
    fn default() -> Self {
        Self::new(
            Connection::open_in_memory().expect("in-memory sqlite connection"),
            DEFAULT_RETENTION_DAYS,
        )
    }
}

fn row_to_message(row: &Row) -> rusqlite::Result<ArchivedMessage> {
    let timestamp_str: String = row.get("timestamp")?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    Ok(ArchivedMessage {
        channel: row.get("channel")?,
        chat_id: row.get("chat_id")?,
        message_id: row.get("message_id")?,
        sender_id: row.get("sender_id")?,
        participant: row.get("participant")?,
        content: row.get("content")?,
        timestamp,
        is_group: row.get::<_, i64>("is_group")? != 0,
    })
}

#[async_trait]
impl ReplyArchivePort for SqliteReplyArchive {
    async fn record_inbound(&self, message: &ArchivedMessage) -> Result<()> {
        self.maybe_purge();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO inbound_messages
             (channel, chat_id, message_id, participant, sender_id, content, is_group, timestamp, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                message.channel,
                message.chat_id,
                message.message_id,
                message.participant,
                message.sender_id,
                message.content,
                message.is_group as i64,
                message.timestamp.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| WardenError::Database(e.to_string()))?;
        Ok(())
    }

    async fn lookup_message(
        &self,
        channel: &str,
        chat_id: &str,
        message_id: &str,
    ) -> Result<Option<ArchivedMessage>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT channel, chat_id, message_id, participant, sender_id, content, is_group, timestamp
             FROM inbound_messages WHERE channel = ?1 AND chat_id = ?2 AND message_id = ?3",
            params![channel, chat_id, message_id],
            row_to_message,
        )
        .optional()
        .map_err(|e| WardenError::Database(e.to_string()))
    }

    async fn lookup_message_any_chat(
        &self,
        channel: &str,
        message_id: &str,
        preferred_chat_id: Option<&str>,
    ) -> Result<Option<ArchivedMessage>> {
        let conn = self.conn.lock().unwrap();
        let preferred = preferred_chat_id.unwrap_or("");
        conn.query_row(
            "SELECT channel, chat_id, message_id, participant, sender_id, content, is_group, timestamp
             FROM inbound_messages
             WHERE channel = ?1 AND message_id = ?2
             ORDER BY CASE WHEN chat_id = ?3 THEN 0 ELSE 1 END, created_at DESC
             LIMIT 1",
            params![channel, message_id, preferred],
            row_to_message,
        )
        .optional()
        .map_err(|e| WardenError::Database(e.to_string()))
    }

    async fn lookup_messages_before(
        &self,
        channel: &str,
        chat_id: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ArchivedMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT channel, chat_id, message_id, participant, sender_id, content, is_group, timestamp
                 FROM inbound_messages
                 WHERE channel = ?1 AND chat_id = ?2 AND timestamp < ?3
                 ORDER BY timestamp DESC
                 LIMIT ?4",
            )
            .map_err(|e| WardenError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(
                params![channel, chat_id, before.to_rfc3339(), limit.max(1) as i64],
                row_to_message,
            )
            .map_err(|e| WardenError::Database(e.to_string()))?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.map_err(|e| WardenError::Database(e.to_string()))?);
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(message_id: &str, ts: DateTime<Utc>) -> ArchivedMessage {
        ArchivedMessage {
            channel: "whatsapp".to_string(),
            chat_id: "123".to_string(),
            message_id: message_id.to_string(),
            sender_id: "456".to_string(),
            participant: None,
            content: format!("message {message_id}"),
            timestamp: ts,
            is_group: false,
        }
    }

    #[tokio::test]
    async fn record_and_lookup_round_trips() {
        let archive = SqliteReplyArchive::default();
        let message = sample("m1", Utc::now());
        archive.record_inbound(&message).await.unwrap();

        let found = archive
            .lookup_message("whatsapp", "123", "m1")
            .await
            .unwrap();
        assert_eq!(found.unwrap().content, "message m1");
    }

    #[tokio::test]
    async fn duplicate_message_id_is_ignored() {
        let archive = SqliteReplyArchive::default();
        let message = sample("m1", Utc::now());
        archive.record_inbound(&message).await.unwrap();
        archive.record_inbound(&message).await.unwrap();

        let rows = archive
            .lookup_messages_before("whatsapp", "123", Utc::now() + chrono::Duration::seconds(5), 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn lookup_messages_before_respects_ordering_and_limit() {
        let archive = SqliteReplyArchive::default();
        let base = Utc::now();
        for i in 0..5 {
            let ts = base + chrono::Duration::seconds(i);
            archive
                .record_inbound(&sample(&format!("m{i}"), ts))
                .await
                .unwrap();
        }

        let anchor = base + chrono::Duration::seconds(4);
        let before = archive
            .lookup_messages_before("whatsapp", "123", anchor, 2)
            .await
            .unwrap();
        assert_eq!(before.len(), 2);
        assert_eq!(before[0].message_id, "m3");
        assert_eq!(before[1].message_id, "m2");
    }

    #[tokio::test]
    async fn lookup_message_any_chat_prefers_given_chat() {
        let archive = SqliteReplyArchive::default();
        let mut elsewhere = sample("shared", Utc::now());
        elsewhere.chat_id = "other".to_string();
        archive.record_inbound(&elsewhere).await.unwrap();

        let mut preferred = sample("shared2", Utc::now());
        preferred.message_id = "shared".to_string();
        preferred.chat_id = "123".to_string();
        archive.record_inbound(&preferred).await.unwrap();

        let found = archive
            .lookup_message_any_chat("whatsapp", "shared", Some("123"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.chat_id, "123");
    }
}
