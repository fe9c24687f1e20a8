//! HTTP error mapping
//!
//! Every engine error kind maps to exactly one status code; bodies
//! carry a short kind tag and a human-readable message, never a
//! backtrace.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use mediseg_core::{CacheError, IngestError, ModelError, PipelineError};

/// Error surfaced by an HTTP handler.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BadInput", detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "StudyNotFound", detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal", detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(kind = self.kind, detail = %self.detail, "request failed");
        } else {
            tracing::warn!(kind = self.kind, detail = %self.detail, "request rejected");
        }
        (
            self.status,
            Json(json!({ "error": self.kind, "detail": self.detail })),
        )
            .into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        let kind = e.kind();
        let status = match kind {
            "BadInput" | "NotEligible" | "PreprocessError" => StatusCode::BAD_REQUEST,
            "StudyNotFound" => StatusCode::NOT_FOUND,
            "Overloaded" => StatusCode::TOO_MANY_REQUESTS,
            "Timeout" => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, kind, e.to_string())
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::BadInput(_) => Self::bad_request(e.to_string()),
            IngestError::NotFound(_) => Self::not_found(e.to_string()),
            IngestError::Io(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "IOFailure", e.to_string())
            }
            _ => Self::internal(e.to_string()),
        }
    }
}

impl From<CacheError> for ApiError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::InvalidStudyId(_) => Self::bad_request(e.to_string()),
            CacheError::NotFound(_) => Self::not_found(e.to_string()),
            _ => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "CacheFailure",
                e.to_string(),
            ),
        }
    }
}

impl From<ModelError> for ApiError {
    fn from(e: ModelError) -> Self {
        let (status, kind) = match &e {
            ModelError::Overloaded { .. } => (StatusCode::TOO_MANY_REQUESTS, "Overloaded"),
            ModelError::ShapeMismatch { .. } => (StatusCode::BAD_REQUEST, "BadInput"),
            ModelError::NotLoaded => (StatusCode::INTERNAL_SERVER_ERROR, "ModelNotLoaded"),
            ModelError::NotFound(_) | ModelError::LoadFailed(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "ModelLoadFailed")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "InferenceFailed"),
        };
        Self::new(status, kind, e.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================
