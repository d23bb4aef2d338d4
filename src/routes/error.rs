use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::services::storage::StoreError;
use crate::services::validation::ValidationError;

/// Errors surfaced to HTTP clients.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("malformed upload: {0}")]
    Multipart(String),

    #[error("sheet not found")]
    NotFound,

    #[error("conversion in progress")]
    InProgress,

    #[error("conversion failed")]
    ConversionFailed,

    #[error("score not ready or conversion failed")]
    NotReady,

    #[error("storage error")]
    Storage(#[source] StoreError),

    #[error("failed to build response")]
    Http(#[from] axum::http::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ApiError::NotFound,
            StoreError::Rejected(e) => ApiError::Validation(e),
            other => ApiError::Storage(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Validation(ValidationError::UnsupportedType(_)) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            ApiError::Validation(_) | ApiError::Multipart(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound | ApiError::InProgress => StatusCode::NOT_FOUND,
            ApiError::ConversionFailed => StatusCode::BAD_REQUEST,
            ApiError::NotReady | ApiError::Storage(_) | ApiError::Http(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if let ApiError::Storage(source) = &self {
            tracing::error!(error = %source, "Storage error while serving request");
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
