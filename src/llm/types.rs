//! Common types for generation requests

use serde::{Deserialize, Serialize};

/// Role of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Stored form, also used on the HTTP API.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One role-tagged turn as sent to the generation service.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// Sampling parameters for one generation request.
#[derive(Debug, Clone)]
pub struct GenConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub max_output_tokens: i32,
}

impl Default for GenConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 0.95,
            top_k: 64,
            max_output_tokens: 65536,
        }
    }
}

/// A generation request: system instruction plus ordered turn history.
#[derive(Debug, Clone)]
pub struct GenRequest {
    pub system: String,
    pub turns: Vec<Turn>,
    pub config: GenConfig,
}

impl GenRequest {
    pub fn new(system: impl Into<String>, turns: Vec<Turn>) -> Self {
        Self {
            system: system.into(),
            turns,
            config: GenConfig::default(),
        }
    }
}
