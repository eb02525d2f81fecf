//! SQLite session store, plus token-usage analytics over the full history.
//!
//! Uses `rusqlite` in synchronous mode behind a `Mutex`; statements are short
//! and never held across an await. WAL mode is enabled so analytics reads do
//! not block streaming writes.
//!
//! Timestamps are stored as fixed-width RFC 3339 text (microseconds, `Z`),
//! so lexical order equals chronological order.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use super::errors::ChatError;
use super::store::SessionStore;
use super::types::{Message, Role, Session};

/// Days returned by [`SqliteSessionStore::token_usage_by_day`].
const USAGE_HISTORY_DAYS: u32 = 30;

// ─── Analytics types ────────────────────────────────────────────────────────

/// Tokens used on one calendar day (UTC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsage {
    /// `YYYY-MM-DD`.
    pub date: String,
    pub tokens: u64,
    pub messages: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub model: String,
    pub tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleUsage {
    pub role: Role,
    pub tokens: u64,
    pub messages: u64,
}

/// Per-session totals over the durable history (including trimmed messages).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub message_count: u64,
    pub total_tokens: u64,
    pub user_tokens: u64,
    pub assistant_tokens: u64,
    /// Seconds between the first and last message.
    pub duration_secs: i64,
}

// ─── Store ──────────────────────────────────────────────────────────────────

/// SQLite-backed [`SessionStore`].
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// Open (or create) the store at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, ChatError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_tables()?;
        tracing::info!(path = %path, "session store opened");
        Ok(store)
    }

    fn create_tables(&self) -> Result<(), ChatError> {
        self.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                model TEXT NOT NULL,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                token_count INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (session_id) REFERENCES sessions(id)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_session
                ON messages(session_id, timestamp);
            ",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ChatError> {
        self.conn.lock().map_err(|_| ChatError::StorageError {
            reason: "connection mutex poisoned".to_string(),
        })
    }

    // ─── Analytics ──────────────────────────────────────────────────────

    /// Token usage per day for the most recent days with activity, newest first.
    pub fn token_usage_by_day(&self) -> Result<Vec<DailyUsage>, ChatError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT substr(timestamp, 1, 10) AS day, SUM(token_count), COUNT(*)
             FROM messages
             GROUP BY day
             ORDER BY day DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![USAGE_HISTORY_DAYS], |row| {
            Ok(DailyUsage {
                date: row.get(0)?,
                tokens: row.get::<_, i64>(1)? as u64,
                messages: row.get::<_, i64>(2)? as u64,
            })
        })?;
        collect_rows(rows)
    }

    /// Token usage per session model, highest first.
    pub fn token_usage_by_model(&self) -> Result<Vec<ModelUsage>, ChatError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT s.model, SUM(m.token_count) AS tokens
             FROM messages m JOIN sessions s ON s.id = m.session_id
             GROUP BY s.model
             ORDER BY tokens DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ModelUsage {
                model: row.get(0)?,
                tokens: row.get::<_, i64>(1)? as u64,
            })
        })?;
        collect_rows(rows)
    }

    /// Token usage split by message role.
    pub fn token_usage_by_role(&self) -> Result<Vec<RoleUsage>, ChatError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT role, SUM(token_count), COUNT(*)
             FROM messages
             GROUP BY role
             ORDER BY role ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RoleUsage {
                role: parse_role(row, 0)?,
                tokens: row.get::<_, i64>(1)? as u64,
                messages: row.get::<_, i64>(2)? as u64,
            })
        })?;
        collect_rows(rows)
    }

    /// Totals for one session over its full persisted history.
    ///
    /// An unknown session has no messages, so its stats are all zero.
    pub fn session_stats(&self, session_id: &str) -> Result<SessionStats, ChatError> {
        let conn = self.conn()?;
        let (count, total, user, assistant, first, last) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(token_count), 0),
                    COALESCE(SUM(CASE WHEN role = 'user' THEN token_count END), 0),
                    COALESCE(SUM(CASE WHEN role = 'assistant' THEN token_count END), 0),
                    MIN(timestamp),
                    MAX(timestamp)
             FROM messages WHERE session_id = ?1",
            params![session_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            },
        )?;

        let duration_secs = match (first, last) {
            (Some(first), Some(last)) => {
                (parse_timestamp(&last)? - parse_timestamp(&first)?).num_seconds()
            }
            _ => 0,
        };

        Ok(SessionStats {
            message_count: count as u64,
            total_tokens: total as u64,
            user_tokens: user as u64,
            assistant_tokens: assistant as u64,
            duration_secs,
        })
    }

    /// Delete every message and session.
    pub fn wipe(&self) -> Result<(), ChatError> {
        let conn = self.conn()?;
        conn.execute_batch("DELETE FROM messages; DELETE FROM sessions;")?;
        tracing::warn!("session store wiped");
        Ok(())
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_session(&self, session: &Session) -> Result<(), ChatError> {
        self.conn()?.execute(
            "INSERT INTO sessions (id, name, model, total_tokens, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.id,
                session.name,
                session.model,
                session.total_tokens,
                format_timestamp(&session.created_at),
                format_timestamp(&session.updated_at),
            ],
        )?;
        Ok(())
    }

    async fn update_session(&self, session: &Session) -> Result<(), ChatError> {
        let changed = self.conn()?.execute(
            "UPDATE sessions SET name = ?2, model = ?3, total_tokens = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                session.id,
                session.name,
                session.model,
                session.total_tokens,
                format_timestamp(&session.updated_at),
            ],
        )?;
        if changed == 0 {
            return Err(ChatError::SessionNotFound {
                session_id: session.id.clone(),
            });
        }
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), ChatError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM messages WHERE session_id = ?1",
            params![session_id],
        )?;
        conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        Ok(())
    }

    async fn get_all_sessions(&self) -> Result<Vec<Session>, ChatError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, model, total_tokens, created_at, updated_at
             FROM sessions
             ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Session {
                id: row.get(0)?,
                name: row.get(1)?,
                model: row.get(2)?,
                messages: Vec::new(),
                total_tokens: row.get(3)?,
                created_at: timestamp_column(row, 4)?,
                updated_at: timestamp_column(row, 5)?,
            })
        })?;
        collect_rows(rows)
    }

    async fn add_message(&self, message: &Message) -> Result<(), ChatError> {
        // Repeated writes of the same message overwrite its mutable fields.
        self.conn()?.execute(
            "INSERT INTO messages (id, session_id, role, content, timestamp, token_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                token_count = excluded.token_count",
            params![
                message.id,
                message.session_id,
                message.role.as_str(),
                message.content,
                format_timestamp(&message.timestamp),
                message.tokens(),
            ],
        )?;
        Ok(())
    }

    async fn update_message(&self, message: &Message) -> Result<(), ChatError> {
        let changed = self.conn()?.execute(
            "UPDATE messages SET content = ?2, token_count = ?3 WHERE id = ?1",
            params![message.id, message.content, message.tokens()],
        )?;
        if changed == 0 {
            return Err(ChatError::MessageNotFound {
                message_id: message.id.clone(),
            });
        }
        Ok(())
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), ChatError> {
        self.conn()?
            .execute("DELETE FROM messages WHERE id = ?1", params![message_id])?;
        Ok(())
    }

    async fn get_session_messages(&self, session_id: &str) -> Result<Vec<Message>, ChatError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, role, content, timestamp, token_count
             FROM messages
             WHERE session_id = ?1
             ORDER BY timestamp ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(Message {
                id: row.get(0)?,
                session_id: row.get(1)?,
                role: parse_role(row, 2)?,
                content: row.get(3)?,
                timestamp: timestamp_column(row, 4)?,
                token_count: Some(row.get(5)?),
            })
        })?;
        collect_rows(rows)
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn collect_rows<T>(
    rows: impl Iterator<Item = Result<T, rusqlite::Error>>,
) -> Result<Vec<T>, ChatError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ChatError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| ChatError::StorageError {
            reason: format!("invalid timestamp '{raw}': {e}"),
        })
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_role(row: &Row<'_>, idx: usize) -> Result<Role, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    raw.parse::<Role>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_store() -> SqliteSessionStore {
        SqliteSessionStore::open(":memory:").unwrap()
    }

    fn message(session: &Session, role: Role, content: &str, tokens: u32) -> Message {
        let mut m = Message::new(&session.id, role, content);
        m.token_count = Some(tokens);
        m
    }

    #[tokio::test]
    async fn test_create_and_list_sessions() {
        let store = test_store();
        let mut older = Session::new("llama3");
        older.updated_at = Utc::now() - Duration::hours(1);
        let newer = Session::new("deepseek-r1:14b");
        store.create_session(&older).await.unwrap();
        store.create_session(&newer).await.unwrap();

        let sessions = store.get_all_sessions().await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, newer.id);
        assert_eq!(sessions[1].model, "llama3");
        assert!(sessions[0].messages.is_empty());
    }

    #[tokio::test]
    async fn test_update_session_persists_metadata() {
        let store = test_store();
        let mut session = Session::new("llama3");
        store.create_session(&session).await.unwrap();

        session.name = "Greetings".to_string();
        session.total_tokens = 17;
        store.update_session(&session).await.unwrap();

        let loaded = store.get_all_sessions().await.unwrap();
        assert_eq!(loaded[0].name, "Greetings");
        assert_eq!(loaded[0].total_tokens, 17);
    }

    #[tokio::test]
    async fn test_update_unknown_session() {
        let store = test_store();
        let err = store.update_session(&Session::new("m")).await.unwrap_err();
        assert!(matches!(err, ChatError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_messages_round_trip_in_order() {
        let store = test_store();
        let session = Session::new("llama3");
        store.create_session(&session).await.unwrap();

        let first = message(&session, Role::User, "hello", 2);
        let second = message(&session, Role::Assistant, "hi there", 3);
        store.add_message(&first).await.unwrap();
        store.add_message(&second).await.unwrap();

        let loaded = store.get_session_messages(&session.id).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, first.id);
        assert_eq!(loaded[0].content, "hello");
        assert_eq!(loaded[0].session_id, session.id);
        assert_eq!(loaded[1].role, Role::Assistant);
        assert_eq!(loaded[1].token_count, Some(3));
    }

    #[tokio::test]
    async fn test_add_message_twice_overwrites() {
        let store = test_store();
        let session = Session::new("llama3");
        store.create_session(&session).await.unwrap();

        let mut reply = message(&session, Role::Assistant, "", 0);
        store.add_message(&reply).await.unwrap();
        reply.content = "Hello".to_string();
        reply.token_count = Some(2);
        store.add_message(&reply).await.unwrap();

        let loaded = store.get_session_messages(&session.id).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].content, "Hello");
    }

    #[tokio::test]
    async fn test_update_and_delete_message() {
        let store = test_store();
        let session = Session::new("llama3");
        store.create_session(&session).await.unwrap();

        let mut reply = message(&session, Role::Assistant, "Hel", 1);
        store.add_message(&reply).await.unwrap();
        reply.content.push_str("lo");
        reply.token_count = Some(2);
        store.update_message(&reply).await.unwrap();
        assert_eq!(
            store.get_session_messages(&session.id).await.unwrap()[0].content,
            "Hello"
        );

        store.delete_message(&reply.id).await.unwrap();
        assert!(store.get_session_messages(&session.id).await.unwrap().is_empty());

        let err = store.update_message(&reply).await.unwrap_err();
        assert!(matches!(err, ChatError::MessageNotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_session_cascades() {
        let store = test_store();
        let session = Session::new("llama3");
        store.create_session(&session).await.unwrap();
        store
            .add_message(&message(&session, Role::User, "hi", 1))
            .await
            .unwrap();

        store.delete_session(&session.id).await.unwrap();
        assert!(store.get_all_sessions().await.unwrap().is_empty());
        assert!(store.get_session_messages(&session.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_message_for_unknown_session_rejected() {
        let store = test_store();
        let orphan = Message::user("no-such-session", "hi");
        assert!(store.add_message(&orphan).await.is_err());
    }

    #[tokio::test]
    async fn test_token_usage_analytics() {
        let store = test_store();
        let a = Session::new("llama3");
        let b = Session::new("deepseek-r1:14b");
        store.create_session(&a).await.unwrap();
        store.create_session(&b).await.unwrap();

        let mut yesterday = message(&a, Role::User, "old", 5);
        yesterday.timestamp = Utc::now() - Duration::days(1);
        store.add_message(&yesterday).await.unwrap();
        store
            .add_message(&message(&a, Role::Assistant, "reply", 7))
            .await
            .unwrap();
        store
            .add_message(&message(&b, Role::User, "question", 20))
            .await
            .unwrap();

        let by_day = store.token_usage_by_day().unwrap();
        assert_eq!(by_day.len(), 2);
        assert!(by_day[0].date > by_day[1].date);
        assert_eq!(by_day[0].tokens, 27);
        assert_eq!(by_day[1].messages, 1);

        let by_model = store.token_usage_by_model().unwrap();
        assert_eq!(by_model[0].model, "deepseek-r1:14b");
        assert_eq!(by_model[0].tokens, 20);
        assert_eq!(by_model[1].tokens, 12);

        let by_role = store.token_usage_by_role().unwrap();
        assert_eq!(by_role.len(), 2);
        assert_eq!(by_role[0].role, Role::Assistant);
        assert_eq!(by_role[0].tokens, 7);
        assert_eq!(by_role[1].tokens, 25);
    }

    #[tokio::test]
    async fn test_session_stats() {
        let store = test_store();
        let session = Session::new("llama3");
        store.create_session(&session).await.unwrap();

        let start = Utc::now() - Duration::seconds(90);
        let mut question = message(&session, Role::User, "q", 4);
        question.timestamp = start;
        let mut answer = message(&session, Role::Assistant, "a", 10);
        answer.timestamp = start + Duration::seconds(90);
        store.add_message(&question).await.unwrap();
        store.add_message(&answer).await.unwrap();

        let stats = store.session_stats(&session.id).unwrap();
        assert_eq!(stats.message_count, 2);
        assert_eq!(stats.total_tokens, 14);
        assert_eq!(stats.user_tokens, 4);
        assert_eq!(stats.assistant_tokens, 10);
        assert_eq!(stats.duration_secs, 90);
    }

    #[tokio::test]
    async fn test_session_stats_empty_and_missing() {
        let store = test_store();
        let session = Session::new("llama3");
        store.create_session(&session).await.unwrap();

        let stats = store.session_stats(&session.id).unwrap();
        assert_eq!(stats.message_count, 0);
        assert_eq!(stats.duration_secs, 0);

        let missing = store.session_stats("missing").unwrap();
        assert_eq!(missing.message_count, 0);
        assert_eq!(missing.total_tokens, 0);
        assert_eq!(missing.duration_secs, 0);
    }

    #[tokio::test]
    async fn test_wipe() {
        let store = test_store();
        let session = Session::new("llama3");
        store.create_session(&session).await.unwrap();
        store
            .add_message(&message(&session, Role::User, "hi", 1))
            .await
            .unwrap();

        store.wipe().unwrap();
        assert!(store.get_all_sessions().await.unwrap().is_empty());
        assert!(store.token_usage_by_day().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.db");
        let path = path.to_str().unwrap();

        let session = Session::new("llama3");
        {
            let store = SqliteSessionStore::open(path).unwrap();
            store.create_session(&session).await.unwrap();
            store
                .add_message(&message(&session, Role::User, "persisted", 3))
                .await
                .unwrap();
        }

        let store = SqliteSessionStore::open(path).unwrap();
        let sessions = store.get_all_sessions().await.unwrap();
        assert_eq!(sessions[0].id, session.id);
        let messages = store.get_session_messages(&session.id).await.unwrap();
        assert_eq!(messages[0].content, "persisted");
    }
}
