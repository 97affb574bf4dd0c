//! Database schema and record types

use crate::llm::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS chats (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    title TEXT,
    created_at TEXT NOT NULL,
    deleted BOOLEAN NOT NULL DEFAULT 0,
    last_message_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chats_session ON chats(session_id, last_message_at DESC);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    chat_id TEXT NOT NULL,
    role TEXT NOT NULL,
    prompt TEXT,
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL,

    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, timestamp);
";

/// A persisted conversation thread belonging to one client session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub session_id: String,
    /// Set lazily from the first reply; `None` until then.
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
    pub last_message_at: DateTime<Utc>,
}

/// One stored message. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub chat_id: String,
    pub role: Role,
    /// The emotion-augmented prompt actually sent to the model, for user
    /// messages. `None` for assistant messages.
    pub prompt: Option<String>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Unknown roles collapse to `User`; the store only ever writes the two
/// known values.
pub fn parse_role(s: &str) -> Role {
    match s {
        "assistant" => Role::Assistant,
        _ => Role::User,
    }
}
