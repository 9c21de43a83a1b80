//! Error types for foodsense.

use crate::auth::AuthError;
use crate::inference::InferenceError;
use crate::quota::QuotaError;
use crate::scans::PersistenceError;
use crate::storage::StorageError;
use thiserror::Error;

/// Result type alias using the crate error.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for the service.
///
/// Component errors convert into this with `?`; the HTTP layer maps each
/// variant to a status code and a client-safe reason string.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The request carried no usable `image` part.
    #[error("No image file provided")]
    MissingImage,

    /// Credential missing or rejected.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Monthly quota exhausted.
    #[error(transparent)]
    Quota(#[from] QuotaError),

    /// Artifact store failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Every inference backend failed.
    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// Scan record could not be written.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// HTTP server error.
    #[error("HTTP error: {0}")]
    Http(String),
}
