//! Identity verification for inbound requests.
//!
//! Every request must carry an ID token, either as `Authorization: Bearer
//! <token>` or in the session cookie. The token is checked before any quota
//! or storage work starts:
//!
//! ```text
//! request headers
//!        │
//!        ▼
//! ┌─────────────────────┐  none   MissingCredential
//! │ Extract credential  │ ──────► (401)
//! └─────────┬───────────┘
//!           ▼
//! ┌─────────────────────┐  hit    Subject
//! │ Check token cache   │ ──────►
//! └─────────┬───────────┘
//!           ▼ miss
//! ┌─────────────────────┐  bad    InvalidCredential
//! │ Verify RS256 + iss/ │ ──────► (403)
//! │ aud/exp against JWKS│
//! └─────────┬───────────┘
//!           ▼
//!      cache + Subject
//! ```

mod cache;
mod keys;
mod verifier;

pub use cache::{CacheStats, TokenCache};
pub use keys::KeySet;
pub use verifier::{JwtVerifier, TokenClaims};

use async_trait::async_trait;
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::HeaderMap;
use thiserror::Error;

/// Sign-in provider name carried by anonymous tokens.
pub const ANONYMOUS_PROVIDER: &str = "anonymous";

/// A verified caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    /// Stable unique identifier.
    pub id: String,
    /// Whether the caller signed in anonymously.
    pub is_anonymous: bool,
    /// Email address, when the provider supplies one.
    pub email: Option<String>,
}

impl Subject {
    /// Create a signed-in subject.
    #[must_use]
    pub fn signed_in(id: impl Into<String>, email: Option<String>) -> Self {
        Self {
            id: id.into(),
            is_anonymous: false,
            email,
        }
    }

    /// Create an anonymous subject.
    #[must_use]
    pub fn anonymous(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_anonymous: true,
            email: None,
        }
    }
}

/// Authentication failures. Always terminal for the request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No credential-bearing header or cookie.
    #[error("Unauthorized")]
    MissingCredential,

    /// Expired, malformed or wrongly signed token.
    #[error("Unauthorized")]
    InvalidCredential(String),

    /// Token validated but carried no usable subject id.
    #[error("Unauthorized: Missing User ID")]
    MissingSubject,

    /// Signing keys could not be obtained.
    #[error("Unauthorized")]
    KeysUnavailable(String),
}

/// Verifies a raw credential and yields the caller's identity.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Verify a raw bearer token.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] when the token is not acceptable.
    async fn verify(&self, raw_credential: &str) -> Result<Subject, AuthError>;
}

/// Pull the bearer token out of the request headers.
///
/// The `Authorization` header wins over the session cookie.
#[must_use]
pub fn extract_credential(headers: &HeaderMap, session_cookie: &str) -> Option<String> {
    if let Some(token) = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
    {
        return Some(token.to_string());
    }

    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == session_cookie && !value.is_empty())
        .map(|(_, value)| value.to_string())
}
