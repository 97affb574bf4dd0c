//! Remote generation service abstraction
//!
//! One production implementation (Gemini); the trait keeps engine tests off
//! the network.

mod error;
mod gemini;
mod types;

pub use error::{LlmError, LlmErrorKind};
pub use gemini::{GeminiClient, DEFAULT_MODEL};
pub use types::*;

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Incremental output of a streaming generation request.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A decoded text fragment.
    Fragment(String),
    /// The remote model stopped the stream for safety/validation reasons,
    /// or a payload could not be decoded. Terminal; whatever arrived before
    /// this point is the whole reply.
    Blocked,
}

/// Fragments arrive lazily; the stream is finite and not restartable.
pub type FragmentStream = BoxStream<'static, Result<StreamEvent, LlmError>>;

/// Common interface for the hosted generation service.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// One-shot, non-streaming generation. Returns the completed text.
    async fn complete(&self, request: &GenRequest) -> Result<String, LlmError>;

    /// Streaming generation. Transport errors surface as stream items and
    /// propagate; safety stops surface as [`StreamEvent::Blocked`].
    async fn stream(&self, request: &GenRequest) -> Result<FragmentStream, LlmError>;
}
