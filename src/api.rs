//! HTTP API for Empath
//!
//! Thin presentation layer: chat CRUD plus the SSE reply stream, with the
//! browser UI served from embedded assets.

mod assets;
mod handlers;
mod session;
mod sse;
mod types;

pub use handlers::create_router;
#[allow(unused_imports)] // Public API re-exports
pub use types::*;

use crate::db::Database;
use crate::emotion::EmotionClassifier;
use crate::llm::GenerationService;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub classifier: Arc<EmotionClassifier>,
    pub llm: Arc<dyn GenerationService>,
}

impl AppState {
    pub fn new(
        db: Database,
        classifier: Arc<EmotionClassifier>,
        llm: Arc<dyn GenerationService>,
    ) -> Self {
        Self {
            db,
            classifier,
            llm,
        }
    }
}
