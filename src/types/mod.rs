//! Type definitions for the serving path

pub mod image;
pub mod prediction;

pub use self::image::{InputTensor, RawImage};
pub use prediction::PredictionResult;
