//! Request handlers.

use super::response::{AnalyzeResponse, ApiError};
use super::AppState;
use crate::auth::extract_credential;
use crate::storage::UploadedArtifact;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

/// Name of the multipart part carrying the image.
pub const IMAGE_FIELD: &str = "image";

/// `POST /analyze-image`
///
/// The caller is verified before the body is read, so unauthenticated
/// requests never get their upload buffered. The rest of the pipeline runs
/// on its own task so that a client disconnect does not cancel it half way;
/// the reserved quota slot is consumed either way.
pub async fn analyze_image(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let credential = extract_credential(&headers, &state.session_cookie);
    let subject = state
        .pipeline
        .authenticate(credential)
        .await
        .map_err(|e| ApiError::from_error(&e, state.expose_diagnostics))?;

    let upload = match multipart {
        Ok(multipart) => read_image(multipart).await?,
        Err(rejection) => {
            debug!("Request is not multipart: {rejection}");
            None
        }
    };

    let pipeline = state.pipeline.clone();
    let outcome = tokio::spawn(async move { pipeline.run_authenticated(subject, upload).await })
        .await
        .map_err(|e| {
            error!("Scan task failed: {e}");
            ApiError::internal()
        })?
        .map_err(|e| ApiError::from_error(&e, state.expose_diagnostics))?;

    Ok(Json(outcome.into()))
}

/// Pull the first `image` part out of the body; other parts are drained.
async fn read_image(mut multipart: Multipart) -> Result<Option<UploadedArtifact>, ApiError> {
    let mut image = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Err(multipart_error(e.status(), &e.body_text())),
        };

        if image.is_some() || field.name() != Some(IMAGE_FIELD) {
            debug!("Ignoring multipart field {:?}", field.name());
            continue;
        }

        let mime_type = field.content_type().map(str::to_string);
        let filename = field.file_name().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| multipart_error(e.status(), &e.body_text()))?;
        debug!(
            "Received image {:?} ({} bytes, {:?})",
            filename,
            bytes.len(),
            mime_type
        );
        image = Some(UploadedArtifact::new(bytes, mime_type, filename));
    }

    Ok(image)
}

fn multipart_error(status: StatusCode, detail: &str) -> ApiError {
    warn!("Malformed multipart body: {detail}");
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::new(status, "Image exceeds the upload size limit")
    } else {
        ApiError::new(StatusCode::BAD_REQUEST, "No image file provided")
    }
}

/// `GET /health`
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
