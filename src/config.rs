//! Configuration management for the serving process

use anyhow::{ensure, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// Environment variable naming the model artifact location
pub const MODEL_URI_ENV: &str = "MODEL_URI";

/// Prefix for environment overrides, e.g. `FASHION_SERVING__SERVER__PORT=9000`
pub const ENV_PREFIX: &str = "FASHION_SERVING";

/// Default configuration file, loaded when present
pub const DEFAULT_CONFIG_PATH: &str = "config/serving.toml";

/// Colour space the model was trained on
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    /// Single luminance channel (Fashion-MNIST style)
    #[default]
    Grayscale,
    /// Three channels, R then G then B
    Rgb,
}

impl ColorMode {
    pub fn channels(&self) -> usize {
        match self {
            ColorMode::Grayscale => 1,
            ColorMode::Rgb => 3,
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub preprocessing: PreprocessingConfig,
    pub categories: Vec<String>,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Largest accepted request body in bytes
    pub max_upload_bytes: usize,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Upper bound on inferences running at once (0 = number of CPUs)
    pub max_concurrent_inferences: usize,
    /// Exit the process instead of serving 503s when the model fails to load
    pub exit_on_load_failure: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_upload_bytes: 8 * 1024 * 1024,
            request_timeout_secs: 30,
            max_concurrent_inferences: 0,
            exit_on_load_failure: false,
        }
    }
}

impl ServerConfig {
    /// Effective concurrency limit
    pub fn inference_permits(&self) -> usize {
        if self.max_concurrent_inferences > 0 {
            return self.max_concurrent_inferences;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

/// Model artifact configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Local path, file://, http(s):// or gs:// URI of the ONNX artifact
    pub location: Option<String>,
    /// Number of intra-op threads for ONNX Runtime (default: 1)
    pub intra_threads: usize,
    /// Timeout for fetching a remote artifact, in seconds
    pub fetch_timeout_secs: u64,
    /// HTTPS endpoint used to resolve gs:// URIs
    pub gcs_endpoint: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            location: None,
            intra_threads: 1,
            fetch_timeout_secs: 120,
            gcs_endpoint: "https://storage.googleapis.com".to_string(),
        }
    }
}

/// Image preprocessing parameters, fixed for the lifetime of the process
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreprocessingConfig {
    /// Model input width in pixels
    pub width: u32,
    /// Model input height in pixels
    pub height: u32,
    pub color: ColorMode,
    /// Per-channel mean subtracted after scaling to [0, 1]
    pub mean: Vec<f32>,
    /// Per-channel standard deviation divided by after mean subtraction
    pub std: Vec<f32>,
    /// Largest accepted width or height of the decoded upload
    pub max_decoded_dimension: u32,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            width: 28,
            height: 28,
            color: ColorMode::Grayscale,
            mean: vec![0.0],
            std: vec![1.0],
            max_decoded_dimension: 4096,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Interval for the periodic summary log, 0 disables it
    pub report_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 60,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

/// Category names in the order of the model's output scores
pub fn default_categories() -> Vec<String> {
    ["bag", "shirt", "sneaker", "dress", "trouser"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl AppConfig {
    /// Load configuration from the default file (if present) and the environment
    pub fn load() -> Result<Self> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific path; a missing file is not an error
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            );

        if let Ok(uri) = std::env::var(MODEL_URI_ENV) {
            builder = builder
                .set_override("model.location", uri)
                .context("Failed to apply MODEL_URI")?;
        }

        let config: AppConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        let config = config.with_default_categories();
        config.validate()?;
        Ok(config)
    }

    fn with_default_categories(mut self) -> Self {
        if self.categories.is_empty() {
            self.categories = default_categories();
        }
        self
    }

    /// Reject settings the serving path cannot work with
    pub fn validate(&self) -> Result<()> {
        let pre = &self.preprocessing;
        let channels = pre.color.channels();

        ensure!(pre.width > 0 && pre.height > 0, "preprocessing.width and height must be > 0");
        ensure!(
            pre.mean.len() == channels,
            "preprocessing.mean needs {} value(s) for {:?}, got {}",
            channels,
            pre.color,
            pre.mean.len()
        );
        ensure!(
            pre.std.len() == channels,
            "preprocessing.std needs {} value(s) for {:?}, got {}",
            channels,
            pre.color,
            pre.std.len()
        );
        ensure!(
            pre.std.iter().all(|&s| s > 0.0 && s.is_finite()),
            "preprocessing.std values must be positive"
        );
        ensure!(
            pre.max_decoded_dimension > 0,
            "preprocessing.max_decoded_dimension must be > 0"
        );

        ensure!(!self.categories.is_empty(), "categories must not be empty");
        let unique: HashSet<&String> = self.categories.iter().collect();
        ensure!(
            unique.len() == self.categories.len(),
            "categories must not contain duplicates"
        );

        ensure!(self.server.max_upload_bytes > 0, "server.max_upload_bytes must be > 0");
        ensure!(
            self.server.request_timeout_secs > 0,
            "server.request_timeout_secs must be > 0"
        );
        ensure!(self.model.intra_threads > 0, "model.intra_threads must be > 0");

        Ok(())
    }
}

/// Defaults with the built-in category list, as used when no file is present
pub fn defaults() -> AppConfig {
    AppConfig::default().with_default_categories()
}
