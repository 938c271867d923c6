//! Prediction endpoint

use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::instrument;

use crate::server::error::ApiError;
use crate::server::state::{Readiness, SharedState};
use crate::types::RawImage;

/// Multipart field names accepted for the upload, in preference order
pub const FILE_FIELDS: [&str; 2] = ["image_data", "file"];

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictResponse {
    pub label: String,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub filename: Option<String>,
}

/// POST /predict - classify an uploaded image
#[instrument(skip_all)]
pub async fn predict(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
    let secs = state.config.server.request_timeout_secs;
    tokio::time::timeout(Duration::from_secs(secs), handle(state, multipart))
        .await
        .map_err(|_| ApiError::Timeout { secs })?
}

async fn handle(
    state: SharedState,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
    let classifier = match state.readiness() {
        Readiness::Ready(classifier) => classifier.clone(),
        Readiness::Initializing => {
            return Err(ApiError::ModelUnavailable {
                state: "initializing",
                detail: "model is still loading".to_string(),
            })
        }
        Readiness::Failed(failure) => {
            return Err(ApiError::ModelUnavailable {
                state: "failed",
                detail: failure.message.clone(),
            })
        }
    };

    let multipart = multipart.map_err(|e| ApiError::InvalidMultipart(e.body_text()))?;
    let raw = read_upload(multipart, state.config.server.max_upload_bytes).await?;
    let filename = raw.filename.clone();

    let permit = state
        .inference_permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    // the permit lives as long as the forward pass, even if this request is dropped
    let prediction = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        classifier.classify(&raw)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("inference task failed: {}", e)))??;

    Ok(Json(PredictResponse {
        label: prediction.label,
        confidence: prediction.confidence,
        filename,
    }))
}

/// Rank of a field as the upload, lower is better
fn field_rank(name: Option<&str>, has_filename: bool) -> Option<usize> {
    if let Some(i) = name.and_then(|n| FILE_FIELDS.iter().position(|f| *f == n)) {
        return Some(i);
    }
    has_filename.then_some(FILE_FIELDS.len())
}

/// Pull the image out of the multipart body.
///
/// Fields named like [`FILE_FIELDS`] win in that order; otherwise the first
/// field that carries a filename is used.
async fn read_upload(mut multipart: Multipart, limit: usize) -> Result<RawImage, ApiError> {
    let field_error = |e: axum::extract::multipart::MultipartError| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge { limit }
        } else {
            ApiError::InvalidMultipart(e.body_text())
        }
    };

    let mut best: Option<(usize, RawImage)> = None;

    while let Some(field) = multipart.next_field().await.map_err(field_error)? {
        let Some(rank) = field_rank(field.name(), field.file_name().is_some()) else {
            continue;
        };
        if best.as_ref().is_some_and(|(current, _)| *current <= rank) {
            continue;
        }

        let content_type = field.content_type().map(str::to_string);
        let filename = field.file_name().map(str::to_string);
        let bytes = field.bytes().await.map_err(field_error)?;

        let mut raw = RawImage::new(bytes);
        if let Some(content_type) = content_type {
            raw = raw.with_content_type(content_type);
        }
        if let Some(filename) = filename {
            raw = raw.with_filename(filename);
        }
        if rank == 0 {
            return Ok(raw);
        }
        best = Some((rank, raw));
    }

    best.map(|(_, raw)| raw).ok_or(ApiError::MissingFile)
}
