//! Empath - emotion-aware conversational assistant
//!
//! Classifies each user message into an emotion distribution, folds it into
//! the prompt sent to a hosted LLM, and streams the reply while persisting
//! chat history in SQLite.

mod api;
mod db;
mod emotion;
mod engine;
mod llm;
mod prompt;
mod system_prompt;

use api::{create_router, AppState};
use db::Database;
use emotion::EmotionClassifier;
use llm::{GeminiClient, DEFAULT_MODEL};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "empath=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    // Configuration
    let db_path = std::env::var("EMPATH_DB_PATH").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.empath/empath.db")
    });

    let model_path = std::env::var("EMPATH_MODEL_PATH")
        .unwrap_or_else(|_| "models/text_emotion.json".to_string());

    let port: u16 = std::env::var("EMPATH_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);

    // Missing credential or classifier artifact is fatal; there is no
    // degraded mode.
    let api_key = std::env::var("GEMINI_API_KEY")
        .map_err(|_| "GEMINI_API_KEY is not set; refusing to start")?;
    let gemini_model =
        std::env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

    tracing::info!(path = %model_path, "Loading emotion classifier");
    let classifier = Arc::new(EmotionClassifier::load(&model_path)?);
    tracing::info!(labels = ?classifier.labels(), "Classifier ready");

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %db_path, "Opening database");
    let db = Database::open(&db_path)?;

    let llm = Arc::new(GeminiClient::new(api_key, gemini_model)?);

    // Create application state
    let state = AppState::new(db, classifier, llm);

    // Create router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(state).layer(cors).layer(compression);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Empath server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
