//! SQLite message store.
//!
//! One row per platform message id. Inserts are idempotent: a second insert of
//! the same id is a no-op that is not reported as an error or counted.

use std::{path::Path, time::Duration};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};

use crate::{
    domain::{ChannelId, ChatMessage, MessageId},
    text::truncate_chars,
    Result,
};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    discord_message_id TEXT NOT NULL UNIQUE,
    channel_id TEXT NOT NULL,
    author_id TEXT NOT NULL,
    author_name TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    attachments_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_timestamp ON messages(timestamp);
CREATE INDEX IF NOT EXISTS idx_discord_message_id ON messages(discord_message_id);

CREATE TABLE IF NOT EXISTS ingest_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
";

// Only a conflict on the platform id is swallowed; NOT NULL and other
// constraint failures still surface as per-row errors.
const INSERT_SQL: &str = "
INSERT INTO messages
    (discord_message_id, channel_id, author_id, author_name, content, timestamp, attachments_count)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT(discord_message_id) DO NOTHING
";

const SELECT_COLUMNS: &str = "id, discord_message_id, channel_id, author_id, author_name, \
     content, timestamp, attachments_count, created_at";

const TOP_AUTHORS: usize = 5;

/// Persisted projection of a [`ChatMessage`].
#[derive(Clone, Debug, PartialEq)]
pub struct StoredMessageRecord {
    pub id: i64,
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: String,
    pub author_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub attachment_count: u32,
    pub inserted_at: DateTime<Utc>,
}

/// Outcome of one [`MessageStore::bulk_insert`] transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InsertReport {
    /// Ids actually written, in input order.
    pub inserted: Vec<MessageId>,
    pub duplicates: usize,
    pub failed: usize,
}

impl InsertReport {
    pub fn inserted_count(&self) -> usize {
        self.inserted.len()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total: u64,
    pub on_day: u64,
    /// `(author_name, message_count)`, busiest first.
    pub top_authors: Vec<(String, u64)>,
}

pub struct MessageStore {
    conn: Connection,
    path: String,
}

impl MessageStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            conn,
            path: path_str,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn,
            path: ":memory:".to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Create tables and indexes if absent. Safe to call on every startup.
    pub fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        tracing::debug!(path = %self.path, "store schema ready");
        Ok(())
    }

    /// Insert every message in a single transaction, skipping ids already stored.
    ///
    /// Row-level failures other than the uniqueness conflict are logged and skipped.
    /// A failed commit, or a row failure that aborts the transaction, fails the
    /// whole batch and leaves nothing of it stored.
    pub fn bulk_insert(&mut self, messages: &[ChatMessage]) -> Result<InsertReport> {
        let mut report = InsertReport::default();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(INSERT_SQL)?;
            for msg in messages {
                let res = stmt.execute(params![
                    msg.id.0,
                    msg.channel_id.0,
                    msg.author_id.0,
                    msg.author_name,
                    msg.content,
                    normalize_timestamp(msg.created_at),
                    msg.attachment_count,
                ]);
                match res {
                    Ok(0) => {
                        tracing::debug!("message {} already stored", msg.id);
                        report.duplicates += 1;
                    }
                    Ok(_) => {
                        tracing::info!(
                            "saved message from {}: {}",
                            msg.author_name,
                            truncate_chars(&msg.content, 50)
                        );
                        report.inserted.push(msg.id.clone());
                    }
                    // Some failures (SQLITE_FULL, RAISE(ROLLBACK)) roll back the
                    // whole transaction; later rows would then autocommit one by one.
                    Err(e) if tx.is_autocommit() => {
                        tracing::error!("batch rolled back at message {}: {e}", msg.id);
                        return Err(e.into());
                    }
                    Err(e) => {
                        tracing::warn!("failed to save message {}: {e}", msg.id);
                        report.failed += 1;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(report)
    }

    pub fn contains(&self, id: &MessageId) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM messages WHERE discord_message_id = ?1",
                params![id.0],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
        Ok(n.max(0) as u64)
    }

    /// Newest messages first.
    pub fn recent(&self, limit: usize) -> Result<Vec<StoredMessageRecord>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM messages ORDER BY timestamp DESC, id DESC LIMIT ?1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], record_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Totals, the message count on `day` (UTC), and the busiest authors.
    pub fn stats(&self, day: NaiveDate) -> Result<StoreStats> {
        let total = self.count()?;

        let day_prefix = day.format("%Y-%m-%d").to_string();
        let on_day: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE substr(timestamp, 1, 10) = ?1",
            params![day_prefix],
            |r| r.get(0),
        )?;

        let mut stmt = self.conn.prepare(
            "SELECT author_name, COUNT(*) AS message_count
             FROM messages
             GROUP BY author_name
             ORDER BY message_count DESC, author_name ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![TOP_AUTHORS as i64], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?;
        let mut top_authors = Vec::new();
        for row in rows {
            let (name, n) = row?;
            top_authors.push((name, n.max(0) as u64));
        }

        Ok(StoreStats {
            total,
            on_day: on_day.max(0) as u64,
            top_authors,
        })
    }

    /// Newest message timestamp committed for `channel` by an earlier run.
    pub fn watermark(&self, channel: &ChannelId) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM ingest_state WHERE key = ?1",
                params![watermark_key(channel)],
                |r| r.get(0),
            )
            .optional()?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(ts) => Ok(Some(ts.with_timezone(&Utc))),
            Err(e) => {
                tracing::warn!("ignoring unreadable watermark {raw:?}: {e}");
                Ok(None)
            }
        }
    }

    /// Advance the watermark. Never moves it backwards.
    pub fn set_watermark(&self, channel: &ChannelId, at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO ingest_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE excluded.value > ingest_state.value",
            params![watermark_key(channel), normalize_timestamp(at)],
        )?;
        Ok(())
    }
}

/// Fixed-width RFC 3339 UTC with microseconds, so text order matches time order.
pub fn normalize_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn watermark_key(channel: &ChannelId) -> String {
    format!("watermark:{}", channel.0)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<StoredMessageRecord> {
    let attachments: i64 = row.get(7)?;
    Ok(StoredMessageRecord {
        id: row.get(0)?,
        message_id: MessageId(row.get(1)?),
        channel_id: ChannelId(row.get(2)?),
        author_id: row.get(3)?,
        author_name: row.get(4)?,
        content: row.get(5)?,
        timestamp: timestamp_column(row, 6)?,
        attachment_count: attachments.max(0) as u32,
        inserted_at: timestamp_column(row, 8)?,
    })
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UserId;
    use chrono::TimeZone;

    fn store() -> MessageStore {
        let s = MessageStore::open_in_memory().unwrap();
        s.ensure_schema().unwrap();
        s
    }

    fn msg(id: &str, author: &str, at: DateTime<Utc>) -> ChatMessage {
        ChatMessage {
            id: MessageId(id.to_string()),
            channel_id: ChannelId("c1".to_string()),
            author_id: UserId(format!("{author}-id")),
            author_name: author.to_string(),
            content: format!("hello from {id}"),
            created_at: at,
            attachment_count: 1,
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    #[test]
    fn ensure_schema_is_idempotent() {
        let s = store();
        s.ensure_schema().unwrap();
        s.ensure_schema().unwrap();
        assert_eq!(s.count().unwrap(), 0);
    }

    #[test]
    fn existing_id_is_skipped_and_not_counted() {
        let mut s = store();
        let first = s.bulk_insert(&[msg("m1", "alice", at(10, 0))]).unwrap();
        assert_eq!(first.inserted_count(), 1);

        let second = s
            .bulk_insert(&[msg("m1", "alice", at(10, 0)), msg("m2", "bob", at(10, 1))])
            .unwrap();
        assert_eq!(second.inserted_count(), 1);
        assert_eq!(second.inserted, vec![MessageId("m2".into())]);
        assert_eq!(second.duplicates, 1);

        assert_eq!(s.count().unwrap(), 2);
        assert!(s.contains(&MessageId("m1".into())).unwrap());
        assert!(s.contains(&MessageId("m2".into())).unwrap());
    }

    #[test]
    fn duplicate_within_one_batch_is_stored_once() {
        let mut s = store();
        let report = s
            .bulk_insert(&[msg("m1", "alice", at(10, 0)), msg("m1", "alice", at(10, 0))])
            .unwrap();
        assert_eq!(report.inserted_count(), 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(s.count().unwrap(), 1);
    }

    #[test]
    fn row_failure_is_skipped_without_aborting_batch() {
        let mut s = store();
        s.conn
            .execute_batch(
                "CREATE TRIGGER reject_boom BEFORE INSERT ON messages
                 WHEN NEW.content = 'boom'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();

        let mut bad = msg("m2", "bob", at(10, 1));
        bad.content = "boom".to_string();
        let report = s
            .bulk_insert(&[msg("m1", "alice", at(10, 0)), bad, msg("m3", "carol", at(10, 2))])
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(
            report.inserted,
            vec![MessageId("m1".into()), MessageId("m3".into())]
        );
        assert!(!s.contains(&MessageId("m2".into())).unwrap());
    }

    #[test]
    fn empty_batch_commits_nothing() {
        let mut s = store();
        let report = s.bulk_insert(&[]).unwrap();
        assert_eq!(report, InsertReport::default());
        assert_eq!(s.count().unwrap(), 0);
    }

    #[test]
    fn timestamps_round_trip_normalized() {
        let mut s = store();
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 15).unwrap()
            + chrono::Duration::microseconds(42);
        s.bulk_insert(&[msg("m1", "alice", ts)]).unwrap();

        let raw: String = s
            .conn
            .query_row("SELECT timestamp FROM messages", [], |r| r.get(0))
            .unwrap();
        assert_eq!(raw, "2024-05-01T09:30:15.000042Z");

        let rec = &s.recent(1).unwrap()[0];
        assert_eq!(rec.timestamp, ts);
        assert_eq!(rec.attachment_count, 1);
        assert_eq!(rec.author_name, "alice");
    }

    #[test]
    fn recent_orders_newest_first() {
        let mut s = store();
        s.bulk_insert(&[
            msg("m1", "alice", at(10, 0)),
            msg("m3", "carol", at(12, 0)),
            msg("m2", "bob", at(11, 0)),
        ])
        .unwrap();

        let ids: Vec<String> = s
            .recent(2)
            .unwrap()
            .into_iter()
            .map(|r| r.message_id.0)
            .collect();
        assert_eq!(ids, vec!["m3", "m2"]);
    }

    #[test]
    fn stats_count_day_and_top_authors() {
        let mut s = store();
        let next_day = Utc.with_ymd_and_hms(2024, 5, 2, 8, 0, 0).unwrap();
        s.bulk_insert(&[
            msg("m1", "alice", at(10, 0)),
            msg("m2", "alice", at(11, 0)),
            msg("m3", "bob", at(12, 0)),
            msg("m4", "bob", next_day),
            msg("m5", "alice", next_day),
        ])
        .unwrap();

        let stats = s.stats(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()).unwrap();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.on_day, 3);
        assert_eq!(
            stats.top_authors,
            vec![("alice".to_string(), 3), ("bob".to_string(), 2)]
        );
    }

    #[test]
    fn watermark_only_moves_forward() {
        let s = store();
        let channel = ChannelId("c1".into());
        assert_eq!(s.watermark(&channel).unwrap(), None);

        s.set_watermark(&channel, at(10, 0)).unwrap();
        s.set_watermark(&channel, at(9, 0)).unwrap();
        assert_eq!(s.watermark(&channel).unwrap(), Some(at(10, 0)));

        s.set_watermark(&channel, at(11, 0)).unwrap();
        assert_eq!(s.watermark(&channel).unwrap(), Some(at(11, 0)));
        assert_eq!(s.watermark(&ChannelId("other".into())).unwrap(), None);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.db");
        {
            let mut s = MessageStore::open(&path).unwrap();
            s.ensure_schema().unwrap();
            s.bulk_insert(&[msg("m1", "alice", at(10, 0))]).unwrap();
        }
        let mut s = MessageStore::open(&path).unwrap();
        s.ensure_schema().unwrap();
        let again = s.bulk_insert(&[msg("m1", "alice", at(10, 0))]).unwrap();
        assert_eq!(again.inserted_count(), 0);
        assert_eq!(s.count().unwrap(), 1);
    }

    #[test]
    fn rollback_inside_batch_fails_and_stores_nothing() {
        let mut s = store();
        s.conn
            .execute_batch(
                "CREATE TRIGGER rollback_m2 BEFORE INSERT ON messages
                 WHEN NEW.discord_message_id = 'm2'
                 BEGIN SELECT RAISE(ROLLBACK, 'disk gone'); END;",
            )
            .unwrap();

        let res = s.bulk_insert(&[
            msg("m1", "alice", at(10, 0)),
            msg("m2", "bob", at(10, 1)),
            msg("m3", "carol", at(10, 2)),
        ]);

        assert!(res.is_err());
        assert_eq!(s.count().unwrap(), 0);
        assert!(!s.contains(&MessageId("m3".into())).unwrap());
    }

    #[test]
    fn failed_commit_is_fatal_and_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.db");
        let mut s = MessageStore::open(&path).unwrap();
        s.ensure_schema().unwrap();
        s.conn.busy_timeout(Duration::ZERO).unwrap();

        // An open read transaction elsewhere keeps the commit from taking its lock.
        let reader = Connection::open(&path).unwrap();
        reader.execute_batch("BEGIN").unwrap();
        let _: i64 = reader
            .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
            .unwrap();

        let res = s.bulk_insert(&[msg("m1", "alice", at(10, 0))]);
        assert!(res.is_err());

        reader.execute_batch("COMMIT").unwrap();
        assert_eq!(s.count().unwrap(), 0);
    }
}
