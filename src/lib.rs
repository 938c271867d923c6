//! Fashion Serving Library
//!
//! Serves an ONNX image classifier for fashion articles over HTTP: the model
//! is fetched and loaded once at startup, each upload is preprocessed into a
//! fixed-size tensor and classified, and every request is recorded for the
//! metrics scraper.

pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod preprocessor;
pub mod server;
pub mod types;

pub use config::AppConfig;
pub use error::{ClassifyError, InferenceError, InvalidInputError, LoadError};
pub use metrics::{MetricSample, MetricSink, MetricsRecorder, MetricsRegistry};
pub use models::{Categories, Classifier, ModelLoader, ModelLocation, ScoreableModel};
pub use preprocessor::Preprocessor;
pub use types::{InputTensor, PredictionResult, RawImage};
