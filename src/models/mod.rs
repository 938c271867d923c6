//! ML model components: loading, scoring and the classification handler

pub mod inference;
pub mod loader;
pub mod scoring;

use crate::error::InferenceError;
use crate::types::InputTensor;

pub use inference::Classifier;
pub use loader::{ModelLoader, ModelLocation, OnnxModel};
pub use scoring::Categories;

/// Anything that maps an input tensor to one score per category.
///
/// Implementations must be safe to call from many threads at once.
pub trait ScoreableModel: Send + Sync {
    /// Human-readable model name for logs
    fn name(&self) -> &str;

    /// Run the forward pass, returning raw scores (probabilities or logits)
    fn forward(&self, tensor: &InputTensor) -> Result<Vec<f32>, InferenceError>;
}
