//! HTTP error mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::error::{ClassifyError, InferenceError, InvalidInputError};

/// Everything `/predict` can fail with, mapped to a status code and stable code
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("model is not ready ({state}): {detail}")]
    ModelUnavailable { state: &'static str, detail: String },

    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),

    #[error("no image file in the multipart body (expected field 'image_data' or 'file')")]
    MissingFile,

    #[error("malformed multipart body: {0}")]
    InvalidMultipart(String),

    #[error("upload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: usize },

    #[error("request did not complete within {secs}s")]
    Timeout { secs: u64 },

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ClassifyError> for ApiError {
    fn from(err: ClassifyError) -> Self {
        match err {
            ClassifyError::InvalidInput(e) => ApiError::InvalidInput(e),
            ClassifyError::Inference(e) => ApiError::Inference(e),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::ModelUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InvalidInput(_) | ApiError::MissingFile | ApiError::InvalidMultipart(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            ApiError::Inference(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::ModelUnavailable { .. } => "model_unavailable",
            ApiError::InvalidInput(e) => e.code(),
            ApiError::MissingFile => "missing_file",
            ApiError::InvalidMultipart(_) => "invalid_multipart",
            ApiError::PayloadTooLarge { .. } => "payload_too_large",
            ApiError::Timeout { .. } => "request_timeout",
            ApiError::Inference(e) => e.code(),
            ApiError::Internal(_) => "internal_error",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            ApiError::ModelUnavailable { .. } => "The model is not available",
            ApiError::InvalidInput(_) => "The uploaded file is not a valid image",
            ApiError::MissingFile => "Missing required file",
            ApiError::InvalidMultipart(_) => "The request body could not be parsed",
            ApiError::PayloadTooLarge { .. } => "The uploaded file is too large",
            ApiError::Timeout { .. } => "The request took too long",
            ApiError::Inference(_) => "The model failed to produce a prediction",
            ApiError::Internal(_) => "An unexpected error occurred",
        }
    }
}

/// Error body: problem-details style `type`, `title`, `detail`
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub title: &'static str,
    pub detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            kind: self.code(),
            title: self.title(),
            detail: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
