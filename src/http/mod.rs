//! HTTP surface.
//!
//! | method | path                 | handler                         |
//! |--------|----------------------|---------------------------------|
//! | POST   | `/analyze-image`     | [`handlers::analyze_image`]     |
//! | POST   | `/api/analyze-image` | [`handlers::analyze_image`]     |
//! | GET    | `/health`            | [`handlers::health`]            |

pub mod handlers;
pub mod response;

pub use response::{AnalyzeResponse, ApiError, ErrorBody};

use crate::pipeline::ScanPipeline;
use axum::body::Body;
use axum::extract::DefaultBodyLimit;
use axum::http::header::{HeaderName, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::Request;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info_span;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// The scan pipeline.
    pub pipeline: Arc<ScanPipeline>,
    /// Cookie consulted when no bearer header is sent.
    pub session_cookie: String,
    /// Whether inference failures report per-backend messages.
    pub expose_diagnostics: bool,
}

/// Build the service router.
pub fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace = TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
        let header = |name: HeaderName| {
            request
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("-")
                .to_string()
        };
        info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            content_type = %header(CONTENT_TYPE),
            content_length = %header(CONTENT_LENGTH),
        )
    });

    Router::new()
        .route("/analyze-image", post(handlers::analyze_image))
        .route("/api/analyze-image", post(handlers::analyze_image))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(trace)
        .layer(cors)
        .with_state(state)
}
