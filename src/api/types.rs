//! API request and response types

use crate::db::{Chat, StoredMessage};
use serde::{Deserialize, Serialize};

/// Request to send a chat message
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
}

/// Response with a list of chats
#[derive(Debug, Serialize)]
pub struct ChatListResponse {
    pub chats: Vec<Chat>,
}

/// Response with a single chat
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub chat: Chat,
}

/// Response with chat and messages
#[derive(Debug, Serialize)]
pub struct ChatWithMessagesResponse {
    pub chat: Chat,
    pub messages: Vec<StoredMessage>,
}

/// Response for lifecycle actions
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
