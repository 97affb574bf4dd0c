//! Chat store
//!
//! Persistence for chat sessions and their ordered messages, partitioned by
//! an opaque client session identifier. The handle is explicitly
//! constructed and passed around; each operation is a single atomic call.

mod schema;

pub use schema::*;

use crate::llm::Role;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Chat Operations ====================

    /// Create a new chat bound to a session identifier.
    pub fn create_chat(&self, session_id: &str) -> DbResult<Chat> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        conn.execute(
            "INSERT INTO chats (id, session_id, title, created_at, deleted, last_message_at)
             VALUES (?1, ?2, NULL, ?3, 0, ?3)",
            params![id, session_id, now.to_rfc3339()],
        )?;

        Ok(Chat {
            id,
            session_id: session_id.to_string(),
            title: None,
            created_at: now,
            deleted: false,
            last_message_at: now,
        })
    }

    /// List a session's chats, most recent activity first. Soft-deleted
    /// chats are excluded.
    pub fn list_chats(&self, session_id: &str) -> DbResult<Vec<Chat>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, title, created_at, deleted, last_message_at
             FROM chats
             WHERE session_id = ?1 AND deleted = 0
             ORDER BY last_message_at DESC",
        )?;

        let rows = stmt.query_map(params![session_id], row_to_chat)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Fetch a chat by id. Absent and soft-deleted chats both come back as
    /// `None`; callers null-check rather than handle errors.
    pub fn get_chat(&self, id: &str) -> DbResult<Option<Chat>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, session_id, title, created_at, deleted, last_message_at
             FROM chats WHERE id = ?1 AND deleted = 0",
            params![id],
            row_to_chat,
        )
        .optional()
        .map_err(DbError::from)
    }

    /// Set a chat's title. No-op when the chat is absent or soft-deleted.
    pub fn save_chat_title(&self, id: &str, title: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE chats SET title = ?1 WHERE id = ?2 AND deleted = 0",
            params![title, id],
        )?;
        Ok(())
    }

    /// Mark a chat deleted without removing it. Idempotent; a no-op for
    /// unknown ids.
    pub fn soft_delete_chat(&self, id: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("UPDATE chats SET deleted = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ==================== Message Operations ====================

    /// Append a message to a chat and bump the chat's `last_message_at`.
    pub fn append_message(
        &self,
        chat_id: &str,
        role: Role,
        content: &str,
        prompt: Option<&str>,
    ) -> DbResult<StoredMessage> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        conn.execute(
            "INSERT INTO messages (id, chat_id, role, prompt, content, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, chat_id, role.as_str(), prompt, content, now.to_rfc3339()],
        )?;

        // last_message_at only moves forward; MAX guards against clock
        // skew making it regress.
        conn.execute(
            "UPDATE chats SET last_message_at = MAX(last_message_at, ?1) WHERE id = ?2",
            params![now.to_rfc3339(), chat_id],
        )?;

        Ok(StoredMessage {
            id,
            chat_id: chat_id.to_string(),
            role,
            prompt: prompt.map(String::from),
            content: content.to_string(),
            timestamp: now,
        })
    }

    /// Fetch a chat's messages ordered oldest first. Works for soft-deleted
    /// chats too; only listings hide those.
    pub fn get_chat_messages(&self, chat_id: &str) -> DbResult<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, role, prompt, content, timestamp
             FROM messages WHERE chat_id = ?1 ORDER BY timestamp ASC, rowid ASC",
        )?;

        let rows = stmt.query_map(params![chat_id], |row| {
            Ok(StoredMessage {
                id: row.get(0)?,
                chat_id: row.get(1)?,
                role: parse_role(&row.get::<_, String>(2)?),
                prompt: row.get(3)?,
                content: row.get(4)?,
                timestamp: parse_datetime(&row.get::<_, String>(5)?),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: row.get(0)?,
        session_id: row.get(1)?,
        title: row.get(2)?,
        created_at: parse_datetime(&row.get::<_, String>(3)?),
        deleted: row.get(4)?,
        last_message_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
