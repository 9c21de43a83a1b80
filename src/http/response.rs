//! Response bodies and error-to-status mapping.

use crate::auth::AuthError;
use crate::error::Error;
use crate::inference::ALL_FAILED_MESSAGE;
use crate::pipeline::ScanOutcome;
use crate::quota::QuotaError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// Body of a successful analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    /// Always `true`.
    pub success: bool,
    /// Generated description.
    pub analysis: String,
    /// Scan record identifier.
    pub scan_id: String,
    /// Backend that produced the description.
    pub model: String,
}

impl From<ScanOutcome> for AnalyzeResponse {
    fn from(outcome: ScanOutcome) -> Self {
        Self {
            success: true,
            analysis: outcome.analysis,
            scan_id: outcome.scan_id,
            model: outcome.backend,
        }
    }
}

/// Body of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Client-facing reason.
    pub error: String,
}

/// An error ready to be sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// HTTP status.
    pub status: StatusCode,
    /// Client-facing reason.
    pub message: String,
}

impl ApiError {
    /// Build an error with an explicit status and reason.
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// A 500 with a generic reason.
    #[must_use]
    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }

    /// Map a pipeline error to a status and a reason safe to show the client.
    ///
    /// With `expose_diagnostics`, an inference failure carries every
    /// per-backend message.
    #[must_use]
    pub fn from_error(err: &Error, expose_diagnostics: bool) -> Self {
        match err {
            Error::MissingImage => Self::new(StatusCode::BAD_REQUEST, err.to_string()),
            Error::Auth(auth) => {
                let status = match auth {
                    AuthError::MissingCredential => StatusCode::UNAUTHORIZED,
                    AuthError::InvalidCredential(reason) | AuthError::KeysUnavailable(reason) => {
                        warn!("Rejected credential: {reason}");
                        StatusCode::FORBIDDEN
                    }
                    AuthError::MissingSubject => StatusCode::FORBIDDEN,
                };
                Self::new(status, auth.to_string())
            }
            Error::Quota(quota @ QuotaError::Exceeded { .. }) => {
                Self::new(StatusCode::FORBIDDEN, quota.to_string())
            }
            Error::Inference(inference) => {
                error!("Inference failed: {}", inference.detailed_message());
                let message = if expose_diagnostics {
                    inference.detailed_message()
                } else {
                    ALL_FAILED_MESSAGE.to_string()
                };
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
            }
            Error::Storage(_) => {
                error!("Request failed: {err}");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store image")
            }
            Error::Persistence(_) => {
                error!("Request failed: {err}");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save scan")
            }
            Error::Quota(QuotaError::Unavailable(_))
            | Error::Io(_)
            | Error::Config(_)
            | Error::Http(_) => {
                error!("Request failed: {err}");
                Self::internal()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}
