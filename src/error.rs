//! Error types for the extraction gateway

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::quota::QuotaWindow;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("Missing or invalid bearer token")]
    Unauthorized,

    #[error("{0}")]
    QuotaExceeded(QuotaWindow),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Extraction returned invalid JSON: {message}")]
    Parse { message: String, raw: String },

    #[error("Database error: {0}")]
    Persistence(#[from] rusqlite::Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::Download(_) => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Storage(_)
            | GatewayError::Inference(_)
            | GatewayError::Parse { .. }
            | GatewayError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a placeholder row should stand in for the failed extraction.
    pub fn is_extraction_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::Inference(_) | GatewayError::Parse { .. }
        )
    }
}

/// A gateway error plus the id of any placeholder row left behind for it.
#[derive(Debug)]
pub struct ExtractionFailure {
    pub error: GatewayError,
    pub record_id: Option<String>,
}

impl From<GatewayError> for ExtractionFailure {
    fn from(error: GatewayError) -> Self {
        Self {
            error,
            record_id: None,
        }
    }
}

impl From<rusqlite::Error> for ExtractionFailure {
    fn from(err: rusqlite::Error) -> Self {
        GatewayError::from(err).into()
    }
}

/// Error response body
#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    record_id: Option<String>,
}

impl IntoResponse for ExtractionFailure {
    fn into_response(self) -> Response {
        let status = self.error.status();
        let (error, details) = match &self.error {
            GatewayError::Persistence(e) => {
                tracing::error!(error = %e, "Database error");
                ("Database error".to_string(), None)
            }
            GatewayError::Parse { raw, .. } => {
                tracing::error!(error = %self.error, "Unparseable model response");
                (self.error.to_string(), Some(raw.clone()))
            }
            GatewayError::QuotaExceeded(window) => {
                tracing::warn!(window = ?window, "Quota exceeded");
                (self.error.to_string(), None)
            }
            other if status.is_server_error() => {
                tracing::error!(error = %other, "Request failed");
                (other.to_string(), None)
            }
            other => {
                tracing::warn!(error = %other, "Request rejected");
                (other.to_string(), None)
            }
        };

        let body = ErrorBody {
            error,
            details,
            record_id: self.record_id,
        };

        (status, Json(body)).into_response()
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        ExtractionFailure::from(self).into_response()
    }
}
