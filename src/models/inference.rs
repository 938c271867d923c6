//! Classification handler: preprocess, forward pass, pick the top category

use crate::config::AppConfig;
use crate::error::ClassifyError;
use crate::metrics::{MetricSample, MetricsRecorder, Outcome};
use crate::models::scoring::Categories;
use crate::models::ScoreableModel;
use crate::preprocessor::Preprocessor;
use crate::types::{PredictionResult, RawImage};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Immutable serving context shared by every request.
///
/// `classify` only reads from `self`; every tensor and result it creates is
/// owned by the calling request.
pub struct Classifier {
    model: Arc<dyn ScoreableModel>,
    preprocessor: Preprocessor,
    categories: Categories,
    recorder: Arc<MetricsRecorder>,
}

impl Classifier {
    pub fn new(
        model: Arc<dyn ScoreableModel>,
        preprocessor: Preprocessor,
        categories: Categories,
        recorder: Arc<MetricsRecorder>,
    ) -> Self {
        info!(
            model = %model.name(),
            categories = ?categories.names(),
            "Classifier initialized"
        );
        Self {
            model,
            preprocessor,
            categories,
            recorder,
        }
    }

    /// Build a classifier with preprocessing and categories from configuration
    pub fn from_config(
        model: Arc<dyn ScoreableModel>,
        config: &AppConfig,
        recorder: Arc<MetricsRecorder>,
    ) -> Self {
        Self::new(
            model,
            Preprocessor::new(&config.preprocessing),
            Categories::new(config.categories.clone()),
            recorder,
        )
    }

    pub fn categories(&self) -> &Categories {
        &self.categories
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Classify one uploaded image.
    ///
    /// Emits one latency sample and one prediction sample whatever the outcome.
    pub fn classify(&self, raw: &RawImage) -> Result<PredictionResult, ClassifyError> {
        let start = Instant::now();
        let result = self.run(raw);
        let elapsed = start.elapsed();

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(e) if e.is_client_error() => Outcome::ClientError,
            Err(_) => Outcome::ServerError,
        };

        self.recorder.record(MetricSample::latency(outcome, elapsed));
        self.recorder.record(MetricSample::prediction(
            outcome,
            result.as_ref().ok().map(|p| p.label.as_str()),
        ));

        let filename = raw.filename.as_deref().unwrap_or("-");
        match &result {
            Ok(prediction) => info!(
                filename = %filename,
                label = %prediction.label,
                confidence = prediction.confidence,
                latency_us = elapsed.as_micros() as u64,
                "Generated prediction"
            ),
            Err(e) if e.is_client_error() => debug!(
                filename = %filename,
                error = %e,
                latency_us = elapsed.as_micros() as u64,
                "Rejected invalid input"
            ),
            Err(e) => error!(
                filename = %filename,
                model = %self.model.name(),
                error = %e,
                latency_us = elapsed.as_micros() as u64,
                "Inference failed"
            ),
        }

        result
    }

    fn run(&self, raw: &RawImage) -> Result<PredictionResult, ClassifyError> {
        let tensor = self.preprocessor.preprocess(raw)?;
        let scores = self.model.forward(&tensor)?;
        Ok(self.categories.select(&scores)?)
    }
}
