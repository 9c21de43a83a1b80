//! Image description backends and the fallback chain across them.
//!
//! ```text
//! image + instruction
//!        │
//!        ▼
//! ┌──────────────┐  fail  ┌──────────────┐  fail  ┌──────────────┐
//! │  backend 1   │ ─────► │  backend 2   │ ─────► │  backend n   │ ─► AllFailed
//! └──────┬───────┘        └──────┬───────┘        └──────┬───────┘
//!        │ ok                    │ ok                    │ ok
//!        ▼                       ▼                       ▼
//!                     { text, backend }
//! ```
//!
//! Backends are tried strictly in order; the first success wins and the
//! remaining backends are never called.

mod gemini;
mod orchestrator;

pub use gemini::GeminiBackend;
pub use orchestrator::{AttemptOutcome, BackendStats, FallbackOrchestrator};

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

/// Client-facing message when every backend failed.
pub const ALL_FAILED_MESSAGE: &str = "All AI models failed to generate content.";

/// Failure of a single backend attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The backend did not answer within its time budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The request could not be sent or the connection failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The provider answered with an error status.
    #[error("provider error {status}: {message}")]
    Provider {
        /// HTTP status returned by the provider.
        status: u16,
        /// Provider message.
        message: String,
    },

    /// The response could not be understood or carried no text.
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Aggregate inference failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InferenceError {
    /// Every backend in the list failed, in order, as `"{backend}: {message}"`.
    #[error("All AI models failed to generate content.")]
    AllFailed {
        /// Per-backend diagnostics, in attempt order.
        messages: Vec<String>,
    },
}

impl InferenceError {
    /// Ordered per-backend diagnostics.
    #[must_use]
    pub fn messages(&self) -> &[String] {
        match self {
            Self::AllFailed { messages } => messages,
        }
    }

    /// Aggregate message including every per-backend diagnostic.
    #[must_use]
    pub fn detailed_message(&self) -> String {
        let details = serde_json::to_string(self.messages()).unwrap_or_else(|_| "[]".to_string());
        format!("All AI models failed. Details: {details}")
    }
}

/// Image bytes and their MIME type, as handed to a backend.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    /// Raw image bytes.
    pub bytes: Bytes,
    /// MIME type of the bytes.
    pub mime_type: String,
}

/// A successful description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inference {
    /// Generated text.
    pub text: String,
    /// Name of the backend that produced it.
    pub backend: String,
}

/// A text-generation service that can describe an image.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Name used in diagnostics and in the scan record.
    fn name(&self) -> &str;

    /// Describe `image` following `instruction`.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] for any failure; the orchestrator moves on
    /// to the next backend.
    async fn generate(&self, instruction: &str, image: &ImagePayload)
        -> Result<String, BackendError>;
}
