//! Metrics scrape endpoint

use axum::{extract::State, http::header, response::IntoResponse};
use std::fmt::Write as _;

use crate::metrics::SINK_ERRORS_TOTAL;
use crate::server::state::SharedState;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// GET /metrics - Prometheus text exposition
pub async fn metrics(State(state): State<SharedState>) -> impl IntoResponse {
    let mut body = state.registry.render();
    let _ = writeln!(body, "# HELP {} Metric samples refused by a sink", SINK_ERRORS_TOTAL);
    let _ = writeln!(body, "# TYPE {} counter", SINK_ERRORS_TOTAL);
    let _ = writeln!(body, "{} {}", SINK_ERRORS_TOTAL, state.recorder.sink_errors());

    ([(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], body)
}
