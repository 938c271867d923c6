//! Shared application state and the model readiness state machine.
//!
//! The process starts `Initializing`. Exactly one transition happens, to
//! either `Ready` or `Failed`, and it is never undone.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::error::LoadError;
use crate::metrics::{MetricSample, MetricsRecorder, MetricsRegistry, MODEL_READY};
use crate::models::{Classifier, ModelLoader, ModelLocation};

/// Why the model never became ready
#[derive(Debug, Clone)]
pub struct LoadFailure {
    pub code: &'static str,
    pub message: String,
}

impl From<&LoadError> for LoadFailure {
    fn from(err: &LoadError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Current readiness, borrowed from the state
pub enum Readiness<'a> {
    Initializing,
    Ready(&'a Arc<Classifier>),
    Failed(&'a LoadFailure),
}

impl Readiness<'_> {
    pub fn as_str(&self) -> &'static str {
        match self {
            Readiness::Initializing => "initializing",
            Readiness::Ready(_) => "ready",
            Readiness::Failed(_) => "failed",
        }
    }
}

/// Shared application state
pub struct AppState {
    /// Full configuration, read-only after startup
    pub config: AppConfig,
    /// Store behind `GET /metrics`
    pub registry: Arc<MetricsRegistry>,
    /// Recorder handed to the classifier
    pub recorder: Arc<MetricsRecorder>,
    /// Bounds concurrent inferences on the blocking pool
    pub inference_permits: Arc<Semaphore>,
    model: OnceLock<Result<Arc<Classifier>, LoadFailure>>,
    started_at: Instant,
}

impl AppState {
    /// State whose recorder feeds only the built-in registry
    pub fn new(config: AppConfig) -> Self {
        let registry = Arc::new(MetricsRegistry::new(&config.categories));
        let recorder = Arc::new(MetricsRecorder::new(vec![registry.clone()]));
        Self::with_metrics(config, registry, recorder)
    }

    pub fn with_metrics(
        config: AppConfig,
        registry: Arc<MetricsRegistry>,
        recorder: Arc<MetricsRecorder>,
    ) -> Self {
        let permits = config.server.inference_permits();
        Self {
            config,
            registry,
            recorder,
            inference_permits: Arc::new(Semaphore::new(permits)),
            model: OnceLock::new(),
            started_at: Instant::now(),
        }
    }

    pub fn readiness(&self) -> Readiness<'_> {
        match self.model.get() {
            None => Readiness::Initializing,
            Some(Ok(classifier)) => Readiness::Ready(classifier),
            Some(Err(failure)) => Readiness::Failed(failure),
        }
    }

    /// Transition to `Ready`. Returns false if a transition already happened.
    pub fn mark_ready(&self, classifier: Classifier) -> bool {
        let model = classifier.model_name().to_string();
        if self.model.set(Ok(Arc::new(classifier))).is_err() {
            warn!(model = %model, "Ignoring second model readiness transition");
            return false;
        }
        self.recorder.record(MetricSample::new(MODEL_READY, 1.0));
        info!(model = %model, "Model ready, serving predictions");
        true
    }

    /// Transition to `Failed`. Returns false if a transition already happened.
    pub fn mark_failed(&self, err: &LoadError) -> bool {
        if self.model.set(Err(LoadFailure::from(err))).is_err() {
            warn!(error = %err, "Ignoring load failure after readiness transition");
            return false;
        }
        error!(code = err.code(), error = %err, "Model failed to load, predictions unavailable");
        true
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

pub type SharedState = Arc<AppState>;

/// Load the configured model and move the state out of `Initializing`.
pub async fn initialize(state: &AppState, loader: &ModelLoader) -> Result<(), LoadError> {
    let result = match state.config.model.location.as_deref() {
        None => Err(LoadError::MissingLocation),
        Some(location) => match ModelLocation::parse(location) {
            Ok(location) => loader.load(&location).await,
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(model) => {
            let classifier =
                Classifier::from_config(Arc::new(model), &state.config, state.recorder.clone());
            state.mark_ready(classifier);
            Ok(())
        }
        Err(e) => {
            state.mark_failed(&e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::models::inference::tests::IntensityModel;

    fn fixture_classifier(state: &AppState) -> Classifier {
        Classifier::from_config(
            Arc::new(IntensityModel::new(5)),
            &state.config,
            state.recorder.clone(),
        )
    }

    #[test]
    fn test_starts_initializing() {
        let state = AppState::new(config::defaults());
        assert_eq!(state.readiness().as_str(), "initializing");
    }

    #[test]
    fn test_ready_is_terminal() {
        let state = AppState::new(config::defaults());

        assert!(state.mark_ready(fixture_classifier(&state)));
        assert!(!state.mark_failed(&LoadError::MissingLocation));
        assert!(!state.mark_ready(fixture_classifier(&state)));
        assert_eq!(state.readiness().as_str(), "ready");
        assert_eq!(state.registry.value(MODEL_READY, &[]), Some(1.0));
    }

    #[tokio::test]
    async fn test_missing_location_fails() {
        let state = AppState::new(config::defaults());
        let loader = ModelLoader::new(&state.config.model);

        let err = initialize(&state, &loader).await.unwrap_err();
        assert!(matches!(err, LoadError::MissingLocation));
        match state.readiness() {
            Readiness::Failed(failure) => assert_eq!(failure.code, "model_location_missing"),
            other => panic!("unexpected readiness {}", other.as_str()),
        }
        assert_eq!(state.registry.value(MODEL_READY, &[]), Some(0.0));
    }
}
