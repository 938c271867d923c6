//! Request-scoped image payloads: the uploaded bytes and the tensor derived from them.

use axum::body::Bytes;

/// Uploaded image bytes plus what the client declared about them
#[derive(Debug, Clone)]
pub struct RawImage {
    /// Encoded image data (PNG, JPEG, ...)
    pub bytes: Bytes,
    /// Declared content type, if the client sent one
    pub content_type: Option<String>,
    /// Original filename, if the client sent one
    pub filename: Option<String>,
}

impl RawImage {
    /// Create a raw image from bytes with no declared metadata
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: None,
            filename: None,
        }
    }

    /// Attach the declared content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Attach the original filename
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Fixed-shape model input in NCHW layout
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
    /// [batch, channels, height, width]
    pub shape: [usize; 4],
    /// Row-major values, `shape.iter().product()` long
    pub data: Vec<f32>,
}

impl InputTensor {
    /// Create a tensor, checking that the data length matches the shape
    pub fn new(shape: [usize; 4], data: Vec<f32>) -> Option<Self> {
        if shape.iter().product::<usize>() != data.len() {
            return None;
        }
        Some(Self { shape, data })
    }

    /// Shape as the signed dimensions ONNX Runtime expects
    pub fn dims(&self) -> Vec<i64> {
        self.shape.iter().map(|&d| d as i64).collect()
    }

    pub fn channels(&self) -> usize {
        self.shape[1]
    }

    /// Mean over all values, used by tests and fixture models
    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().sum::<f32>() / self.data.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_shape_must_match_data() {
        assert!(InputTensor::new([1, 1, 2, 2], vec![0.0; 4]).is_some());
        assert!(InputTensor::new([1, 1, 2, 2], vec![0.0; 3]).is_none());
    }

    #[test]
    fn test_tensor_dims() {
        let tensor = InputTensor::new([1, 3, 4, 5], vec![0.5; 60]).unwrap();
        assert_eq!(tensor.dims(), vec![1, 3, 4, 5]);
        assert_eq!(tensor.channels(), 3);
        assert!((tensor.mean() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_raw_image_builder() {
        let raw = RawImage::new(vec![1u8, 2, 3])
            .with_content_type("image/png")
            .with_filename("0.png");

        assert_eq!(raw.len(), 3);
        assert_eq!(raw.content_type.as_deref(), Some("image/png"));
        assert_eq!(raw.filename.as_deref(), Some("0.png"));
    }
}
