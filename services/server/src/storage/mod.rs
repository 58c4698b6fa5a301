//! Durable store: the contract the dispatcher relies on, plus the embedded
//! SQLite implementation.
//!
//! Every operation is one transaction; the connection is internally locked
//! so the store is safe to share across connection tasks. PRAGMAs applied at
//! open: WAL, synchronous=FULL, wal_autocheckpoint=1000, foreign_keys=ON.
//! `PRAGMA integrity_check` runs at open and failing it is fatal.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension};
use thiserror::Error;

use crate::auth;

const SCHEMA_SQL: &str = include_str!("schema.sql");

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("message id space exhausted")]
    IdOverflow,
    #[error("store lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One message row as the store hands it back.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: u32,
    pub sender: String,
    pub recipient: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub delivered: bool,
    pub read: bool,
}

/// Per-row deletion report: who the deleted message was addressed to and
/// whether it was still unread when it went away. Clients use this to
/// reconcile their unread indicators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedRow {
    pub recipient: String,
    pub was_unread: bool,
}

/// The store contract the dispatcher is written against.
///
/// Implementations must be internally synchronized and preserve transaction
/// granularity per operation. `store_message` ids are strictly increasing in
/// insertion order.
pub trait MessageStore: Send + Sync {
    /// True on insert, false when the username is taken.
    fn create_user(&self, username: &str, password: &str) -> StoreResult<bool>;
    /// True iff the user exists and the password matches the stored verifier.
    fn verify_user(&self, username: &str, password: &str) -> StoreResult<bool>;
    fn user_exists(&self, username: &str) -> StoreResult<bool>;
    /// Insert one message; both parties must exist. Returns the new id.
    fn store_message(
        &self,
        sender: &str,
        recipient: &str,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<u32>;
    /// Unread messages for `recipient`, oldest first, at most `limit`.
    fn get_unread_messages(
        &self,
        recipient: &str,
        limit: Option<u32>,
    ) -> StoreResult<Vec<StoredMessage>>;
    /// Both directions of a conversation, oldest first, at most `limit`.
    fn get_messages_between_users(
        &self,
        user1: &str,
        user2: &str,
        limit: u32,
    ) -> StoreResult<Vec<StoredMessage>>;
    /// Idempotent.
    fn mark_delivered(&self, id: u32) -> StoreResult<()>;
    /// Mark the given ids read, only where `recipient` matches.
    fn mark_read(&self, ids: &[u32], recipient: &str) -> StoreResult<()>;
    /// Mark every unread message from `sender` to `recipient` as read.
    fn mark_read_from_user(&self, recipient: &str, sender: &str) -> StoreResult<()>;
    fn get_unread_count(&self, recipient: &str) -> StoreResult<u32>;
    /// Delete the ids that belong to the conversation between `acting_user`
    /// and `other_user`; report each deleted row's recipient and unread state.
    fn delete_messages(
        &self,
        ids: &[u32],
        acting_user: &str,
        other_user: &str,
    ) -> StoreResult<(u32, Vec<DeletedRow>)>;
    /// Remove the user and every message they sent or received, atomically.
    /// False when no such user exists.
    fn delete_user(&self, username: &str) -> StoreResult<bool>;
    fn get_all_users(&self) -> StoreResult<Vec<String>>;
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        Self::init(Connection::open(path)?)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA wal_autocheckpoint=1000;
             PRAGMA foreign_keys=ON;",
        )?;
        let check: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if check != "ok" {
            return Err(StoreError::IntegrityCheckFailed(check));
        }
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl MessageStore for SqliteStore {
    fn create_user(&self, username: &str, password: &str) -> StoreResult<bool> {
        let verifier = auth::hash_password(password);
        let created_at = format_timestamp(Utc::now());
        let conn = self.lock()?;
        match conn.execute(
            "INSERT INTO users (username, password_verifier, created_at) VALUES (?1, ?2, ?3)",
            params![username, verifier, created_at],
        ) {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn verify_user(&self, username: &str, password: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        let verifier: Option<Vec<u8>> = conn
            .query_row(
                "SELECT password_verifier FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        Ok(verifier.is_some_and(|v| auth::verify_password(&v, password)))
    }

    fn user_exists(&self, username: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn store_message(
        &self,
        sender: &str,
        recipient: &str,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<u32> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO messages (sender, recipient, content, timestamp, read, delivered)
             VALUES (?1, ?2, ?3, ?4, 0, 0)",
            params![sender, recipient, content, format_timestamp(timestamp)],
        )?;
        u32::try_from(conn.last_insert_rowid()).map_err(|_| StoreError::IdOverflow)
    }

    fn get_unread_messages(
        &self,
        recipient: &str,
        limit: Option<u32>,
    ) -> StoreResult<Vec<StoredMessage>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, sender, recipient, content, timestamp, read, delivered
             FROM messages
             WHERE recipient = ?1 AND read = 0
             ORDER BY timestamp ASC, id ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![recipient, limit.map_or(-1, i64::from)],
            map_message,
        )?;
        collect_messages(rows)
    }

    fn get_messages_between_users(
        &self,
        user1: &str,
        user2: &str,
        limit: u32,
    ) -> StoreResult<Vec<StoredMessage>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, sender, recipient, content, timestamp, read, delivered
             FROM messages
             WHERE (sender = ?1 AND recipient = ?2) OR (sender = ?2 AND recipient = ?1)
             ORDER BY timestamp ASC, id ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![user1, user2, i64::from(limit)], map_message)?;
        collect_messages(rows)
    }

    fn mark_delivered(&self, id: u32) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute("UPDATE messages SET delivered = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn mark_read(&self, ids: &[u32], recipient: &str) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.lock()?;
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "UPDATE messages SET read = 1 WHERE recipient = ? AND id IN ({placeholders})"
        );
        let args = std::iter::once(Value::from(recipient.to_owned()))
            .chain(ids.iter().map(|id| Value::from(i64::from(*id))));
        conn.execute(&sql, params_from_iter(args))?;
        Ok(())
    }

    fn mark_read_from_user(&self, recipient: &str, sender: &str) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE messages SET read = 1 WHERE recipient = ?1 AND sender = ?2 AND read = 0",
            params![recipient, sender],
        )?;
        Ok(())
    }

    fn get_unread_count(&self, recipient: &str) -> StoreResult<u32> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE recipient = ?1 AND read = 0",
            params![recipient],
            |row| row.get(0),
        )?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    fn delete_messages(
        &self,
        ids: &[u32],
        acting_user: &str,
        other_user: &str,
    ) -> StoreResult<(u32, Vec<DeletedRow>)> {
        if ids.is_empty() {
            return Ok((0, Vec::new()));
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let placeholders = vec!["?"; ids.len()].join(",");

        // Capture the unread state before the rows disappear; only rows that
        // belong to this conversation are eligible.
        let deleted = {
            let sql = format!(
                "SELECT recipient, read FROM messages
                 WHERE ((sender = ? AND recipient = ?) OR (sender = ? AND recipient = ?))
                   AND id IN ({placeholders})"
            );
            let args = [
                Value::from(acting_user.to_owned()),
                Value::from(other_user.to_owned()),
                Value::from(other_user.to_owned()),
                Value::from(acting_user.to_owned()),
            ]
            .into_iter()
            .chain(ids.iter().map(|id| Value::from(i64::from(*id))));
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args), |row| {
                Ok(DeletedRow {
                    recipient: row.get(0)?,
                    was_unread: !row.get::<_, bool>(1)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let sql = format!(
            "DELETE FROM messages
             WHERE ((sender = ? AND recipient = ?) OR (sender = ? AND recipient = ?))
               AND id IN ({placeholders})"
        );
        let args = [
            Value::from(acting_user.to_owned()),
            Value::from(other_user.to_owned()),
            Value::from(other_user.to_owned()),
            Value::from(acting_user.to_owned()),
        ]
        .into_iter()
        .chain(ids.iter().map(|id| Value::from(i64::from(*id))));
        let count = tx.execute(&sql, params_from_iter(args))?;
        tx.commit()?;

        Ok((u32::try_from(count).unwrap_or(u32::MAX), deleted))
    }

    fn delete_user(&self, username: &str) -> StoreResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE sender = ?1 OR recipient = ?1",
            params![username],
        )?;
        let removed = tx.execute("DELETE FROM users WHERE username = ?1", params![username])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn get_all_users(&self) -> StoreResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT username FROM users ORDER BY username")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn map_message(row: &rusqlite::Row<'_>) -> Result<StoredMessage, rusqlite::Error> {
    let id: i64 = row.get(0)?;
    let raw_ts: String = row.get(4)?;
    Ok(StoredMessage {
        id: u32::try_from(id).unwrap_or(u32::MAX),
        sender: row.get(1)?,
        recipient: row.get(2)?,
        content: row.get(3)?,
        timestamp: parse_timestamp(&raw_ts, 4)?,
        read: row.get(5)?,
        delivered: row.get(6)?,
    })
}

fn collect_messages(
    rows: impl Iterator<Item = Result<StoredMessage, rusqlite::Error>>,
) -> StoreResult<Vec<StoredMessage>> {
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str, column: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_applies_pragmas_and_schema() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = SqliteStore::open(&dir.path().join("chat.db")).expect("open store");
        let conn = store.lock().unwrap();

        let mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        let fk: i64 = conn
            .pragma_query_value(None, "foreign_keys", |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('users','messages')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }

    #[test]
    fn foreign_keys_reject_unknown_parties() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_user("alice", "pw1").unwrap();
        let err = store.store_message("alice", "ghost", "hi", Utc::now());
        assert!(err.is_err(), "insert with unknown recipient must fail");
    }

    #[test]
    fn timestamps_survive_storage() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_user("alice", "pw1").unwrap();
        store.create_user("bob", "pw2").unwrap();
        let sent = Utc::now();
        store.store_message("bob", "alice", "hi", sent).unwrap();
        let messages = store.get_unread_messages("alice", None).unwrap();
        assert_eq!(messages.len(), 1);
        // Micros-resolution round trip.
        assert_eq!(
            messages[0].timestamp.timestamp_micros(),
            sent.timestamp_micros()
        );
    }
}
