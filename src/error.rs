//! Error taxonomy for the serving core.
//!
//! `LoadError` only happens at startup. `InvalidInputError` is the client's
//! fault and maps to 4xx. `InferenceError` is ours and maps to 5xx. Every
//! variant has a stable `code()` that ends up in the JSON error body.

use thiserror::Error;

/// Failure to obtain a ready model at startup
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no model location configured (set MODEL_URI or model.location)")]
    MissingLocation,

    #[error("invalid model location '{location}': {reason}")]
    InvalidLocation { location: String, reason: String },

    #[error("model location '{location}' is unreachable: {reason}")]
    Unreachable { location: String, reason: String },

    #[error("fetching model from '{location}' timed out after {secs}s")]
    Timeout { location: String, secs: u64 },

    #[error("model artifact from '{location}' is corrupt or incompatible: {reason}")]
    Corrupt { location: String, reason: String },

    #[error("ONNX Runtime could not be initialized: {0}")]
    Runtime(String),
}

impl LoadError {
    pub fn code(&self) -> &'static str {
        match self {
            LoadError::MissingLocation => "model_location_missing",
            LoadError::InvalidLocation { .. } => "model_location_invalid",
            LoadError::Unreachable { .. } => "model_unreachable",
            LoadError::Timeout { .. } => "model_fetch_timeout",
            LoadError::Corrupt { .. } => "model_corrupt",
            LoadError::Runtime(_) => "model_runtime_error",
        }
    }
}

/// The uploaded bytes could not be turned into a model input
#[derive(Debug, Error)]
pub enum InvalidInputError {
    #[error("uploaded file is empty")]
    Empty,

    #[error("unsupported or unrecognised image format{}", declared_suffix(.declared))]
    UnsupportedFormat { declared: Option<String> },

    #[error("image could not be decoded: {0}")]
    Decode(String),

    #[error("image dimensions exceed the allowed limit: {0}")]
    TooLarge(String),
}

fn declared_suffix(declared: &Option<String>) -> String {
    match declared {
        Some(content_type) => format!(" (declared as {})", content_type),
        None => String::new(),
    }
}

impl InvalidInputError {
    pub fn code(&self) -> &'static str {
        "invalid_input"
    }
}

/// Model execution or postprocessing failed for a valid input
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("model execution failed: {0}")]
    Execution(String),

    #[error("unexpected model output: {0}")]
    UnexpectedOutput(String),
}

impl InferenceError {
    pub fn code(&self) -> &'static str {
        "inference_error"
    }
}

/// Outcome of a failed `classify` call
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),

    #[error(transparent)]
    Inference(#[from] InferenceError),
}

impl ClassifyError {
    pub fn code(&self) -> &'static str {
        match self {
            ClassifyError::InvalidInput(e) => e.code(),
            ClassifyError::Inference(e) => e.code(),
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, ClassifyError::InvalidInput(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(InvalidInputError::Empty.code(), "invalid_input");
        assert_eq!(
            InferenceError::Execution("boom".to_string()).code(),
            "inference_error"
        );
        assert_eq!(LoadError::MissingLocation.code(), "model_location_missing");
    }

    #[test]
    fn test_classify_error_classification() {
        let client: ClassifyError = InvalidInputError::Decode("bad".to_string()).into();
        let server: ClassifyError = InferenceError::UnexpectedOutput("nan".to_string()).into();

        assert!(client.is_client_error());
        assert!(!server.is_client_error());
        assert_eq!(client.code(), "invalid_input");
        assert_eq!(server.code(), "inference_error");
    }

    #[test]
    fn test_unsupported_format_message() {
        let err = InvalidInputError::UnsupportedFormat {
            declared: Some("text/plain".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "unsupported or unrecognised image format (declared as text/plain)"
        );
    }
}
