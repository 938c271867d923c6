//! ONNX model loader

use crate::config::ModelConfig;
use crate::error::{InferenceError, LoadError};
use crate::models::ScoreableModel;
use crate::types::InputTensor;
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// Where the model artifact lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelLocation {
    /// Path on the local filesystem
    Local(PathBuf),
    /// Plain HTTP(S) URL
    Http(String),
    /// Google Cloud Storage object, fetched over the HTTPS endpoint
    Gcs { bucket: String, object: String },
}

impl ModelLocation {
    /// Parse a location string: `gs://bucket/object`, `http(s)://...`,
    /// `file:///path` or a bare path.
    pub fn parse(location: &str) -> Result<Self, LoadError> {
        let location = location.trim();
        if location.is_empty() {
            return Err(LoadError::MissingLocation);
        }

        if let Some(rest) = location.strip_prefix("gs://") {
            let (bucket, object) = rest.split_once('/').unwrap_or((rest, ""));
            let object = object.trim_start_matches('/');
            if bucket.is_empty() || object.is_empty() {
                return Err(LoadError::InvalidLocation {
                    location: location.to_string(),
                    reason: "expected gs://<bucket>/<object>".to_string(),
                });
            }
            return Ok(ModelLocation::Gcs {
                bucket: bucket.to_string(),
                object: object.to_string(),
            });
        }

        if location.starts_with("http://") || location.starts_with("https://") {
            return Ok(ModelLocation::Http(location.to_string()));
        }

        if let Some(path) = location.strip_prefix("file://") {
            if path.is_empty() {
                return Err(LoadError::InvalidLocation {
                    location: location.to_string(),
                    reason: "file:// URI has no path".to_string(),
                });
            }
            return Ok(ModelLocation::Local(PathBuf::from(path)));
        }

        if location.contains("://") {
            return Err(LoadError::InvalidLocation {
                location: location.to_string(),
                reason: "unsupported URI scheme".to_string(),
            });
        }

        Ok(ModelLocation::Local(PathBuf::from(location)))
    }

    /// URL to fetch for remote locations
    pub fn url(&self, gcs_endpoint: &str) -> Option<String> {
        match self {
            ModelLocation::Local(_) => None,
            ModelLocation::Http(url) => Some(url.clone()),
            ModelLocation::Gcs { bucket, object } => Some(format!(
                "{}/{}/{}",
                gcs_endpoint.trim_end_matches('/'),
                bucket,
                object
            )),
        }
    }

    /// Model name derived from the artifact's file name
    pub fn model_name(&self) -> String {
        let tail = match self {
            ModelLocation::Local(path) => path.to_string_lossy().into_owned(),
            ModelLocation::Http(url) => url.split('?').next().unwrap_or(url).to_string(),
            ModelLocation::Gcs { object, .. } => object.clone(),
        };
        tail.rsplit('/')
            .find(|s| !s.is_empty())
            .map(|s| s.trim_end_matches(".onnx").to_string())
            .unwrap_or_else(|| "model".to_string())
    }
}

impl fmt::Display for ModelLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelLocation::Local(path) => write!(f, "{}", path.display()),
            ModelLocation::Http(url) => write!(f, "{}", url),
            ModelLocation::Gcs { bucket, object } => write!(f, "gs://{}/{}", bucket, object),
        }
    }
}

/// Loaded ONNX model with metadata
pub struct OnnxModel {
    /// Model name
    pub name: String,
    /// ONNX Runtime session; `run` needs exclusive access
    session: Mutex<Session>,
    /// Input name for the model
    pub input_name: String,
    /// Output name for class scores
    pub output_name: String,
}

impl OnnxModel {
    /// Build a session from serialized ONNX bytes
    pub fn from_bytes(
        name: &str,
        bytes: &[u8],
        intra_threads: usize,
        location: &str,
    ) -> Result<Self, LoadError> {
        ort::init()
            .commit()
            .map_err(|e| LoadError::Runtime(e.to_string()))?;

        let corrupt = |e: ort::Error| LoadError::Corrupt {
            location: location.to_string(),
            reason: e.to_string(),
        };

        let session = Session::builder()
            .map_err(|e| LoadError::Runtime(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| LoadError::Runtime(e.to_string()))?
            .with_intra_threads(intra_threads)
            .map_err(|e| LoadError::Runtime(e.to_string()))?
            .commit_from_memory(bytes)
            .map_err(corrupt)?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| LoadError::Corrupt {
                location: location.to_string(),
                reason: "model graph has no inputs".to_string(),
            })?;

        let output_name = session
            .outputs
            .iter()
            .find(|o| o.name.contains("prob") || o.name.contains("output"))
            .or_else(|| session.outputs.last())
            .map(|o| o.name.clone())
            .ok_or_else(|| LoadError::Corrupt {
                location: location.to_string(),
                reason: "model graph has no outputs".to_string(),
            })?;

        info!(
            model = %name,
            input = %input_name,
            output = %output_name,
            "Model loaded successfully"
        );

        Ok(Self {
            name: name.to_string(),
            session: Mutex::new(session),
            input_name,
            output_name,
        })
    }
}

impl ScoreableModel for OnnxModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, tensor: &InputTensor) -> Result<Vec<f32>, InferenceError> {
        use ort::value::Tensor;

        let exec = |e: ort::Error| InferenceError::Execution(e.to_string());

        let input = Tensor::from_array((tensor.dims(), tensor.data.clone())).map_err(exec)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| InferenceError::Execution("model session lock poisoned".to_string()))?;

        let outputs = session
            .run(ort::inputs![&self.input_name => input])
            .map_err(exec)?;

        let output = outputs.get(self.output_name.as_str()).ok_or_else(|| {
            InferenceError::UnexpectedOutput(format!("missing output '{}'", self.output_name))
        })?;

        let (_shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::UnexpectedOutput(e.to_string()))?;

        Ok(data.to_vec())
    }
}

/// Loader for the serving model
pub struct ModelLoader {
    /// Number of threads for ONNX inference
    intra_threads: usize,
    fetch_timeout: Duration,
    gcs_endpoint: String,
}

impl ModelLoader {
    /// Create a new model loader from configuration
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            intra_threads: config.intra_threads.max(1),
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs),
            gcs_endpoint: config.gcs_endpoint.clone(),
        }
    }

    /// Fetch the artifact and build a ready-to-run model. Called once at startup.
    pub async fn load(&self, location: &ModelLocation) -> Result<OnnxModel, LoadError> {
        let name = location.model_name();
        let shown = location.to_string();

        info!(model = %name, location = %shown, threads = self.intra_threads, "Loading ONNX model");

        let bytes = self.fetch(location).await?;
        debug!(model = %name, bytes = bytes.len(), "Model artifact fetched");

        let threads = self.intra_threads;
        tokio::task::spawn_blocking(move || OnnxModel::from_bytes(&name, &bytes, threads, &shown))
            .await
            .map_err(|e| LoadError::Runtime(format!("model build task failed: {}", e)))?
    }

    /// Read the raw artifact bytes
    pub async fn fetch(&self, location: &ModelLocation) -> Result<Vec<u8>, LoadError> {
        match location {
            ModelLocation::Local(path) => {
                tokio::fs::read(path)
                    .await
                    .map_err(|e| LoadError::Unreachable {
                        location: location.to_string(),
                        reason: e.to_string(),
                    })
            }
            remote => {
                let url = remote
                    .url(&self.gcs_endpoint)
                    .ok_or_else(|| LoadError::InvalidLocation {
                        location: remote.to_string(),
                        reason: "no URL for location".to_string(),
                    })?;
                self.fetch_url(&url, &remote.to_string()).await
            }
        }
    }

    async fn fetch_url(&self, url: &str, location: &str) -> Result<Vec<u8>, LoadError> {
        let unreachable = |reason: String| LoadError::Unreachable {
            location: location.to_string(),
            reason,
        };
        let classify = |e: reqwest::Error| {
            if e.is_timeout() {
                LoadError::Timeout {
                    location: location.to_string(),
                    secs: self.fetch_timeout.as_secs(),
                }
            } else {
                unreachable(e.to_string())
            }
        };

        let client = reqwest::Client::builder()
            .timeout(self.fetch_timeout)
            .build()
            .map_err(|e| unreachable(e.to_string()))?;

        let response = client.get(url).send().await.map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(unreachable(format!("HTTP status {}", status)));
        }

        let bytes = response.bytes().await.map_err(classify)?;
        Ok(bytes.to_vec())
    }
}
