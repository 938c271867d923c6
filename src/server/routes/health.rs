//! Health check endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::server::state::{Readiness, SharedState};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub detail: Option<String>,
}

/// GET /health - 200 once the model is ready, 503 otherwise
pub async fn health_check(State(state): State<SharedState>) -> (StatusCode, Json<HealthResponse>) {
    let readiness = state.readiness();
    let (code, model, detail) = match &readiness {
        Readiness::Ready(classifier) => {
            (StatusCode::OK, Some(classifier.model_name().to_string()), None)
        }
        Readiness::Initializing => (StatusCode::SERVICE_UNAVAILABLE, None, None),
        Readiness::Failed(failure) => (
            StatusCode::SERVICE_UNAVAILABLE,
            None,
            Some(format!("{}: {}", failure.code, failure.message)),
        ),
    };

    (
        code,
        Json(HealthResponse {
            status: readiness.as_str().to_string(),
            uptime_seconds: state.uptime_seconds(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            model,
            detail,
        }),
    )
}

/// GET /ping - liveness heartbeat
pub async fn ping() -> &'static str {
    "pong"
}
