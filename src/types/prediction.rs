//! Prediction result returned to callers

use serde::{Deserialize, Serialize};

/// Top category and its confidence for one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    /// Category name, always a member of the configured category set
    pub label: String,
    /// Probability of `label`, in [0, 1]
    pub confidence: f32,
}

impl PredictionResult {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}
