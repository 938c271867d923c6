//! Image preprocessing for model inference.
//!
//! Turns uploaded bytes into the fixed-size tensor the model was trained on.
//! Parameters are fixed at construction, so the same bytes always produce the
//! same tensor.

use crate::config::{ColorMode, PreprocessingConfig};
use crate::error::InvalidInputError;
use crate::types::{InputTensor, RawImage};
use image::imageops::FilterType;
use image::{DynamicImage, ImageError, ImageReader, Limits};
use std::io::Cursor;

/// Resize filter used for every image; changing it changes model inputs
const RESIZE_FILTER: FilterType = FilterType::Triangle;

/// Decodes, resizes and normalizes uploaded images.
pub struct Preprocessor {
    width: u32,
    height: u32,
    color: ColorMode,
    mean: Vec<f32>,
    std: Vec<f32>,
    max_dimension: u32,
}

impl Preprocessor {
    /// Create a preprocessor from validated configuration.
    pub fn new(config: &PreprocessingConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            color: config.color,
            mean: config.mean.clone(),
            std: config.std.clone(),
            max_dimension: config.max_decoded_dimension,
        }
    }

    /// Shape of every tensor this preprocessor produces, NCHW
    pub fn output_shape(&self) -> [usize; 4] {
        [
            1,
            self.color.channels(),
            self.height as usize,
            self.width as usize,
        ]
    }

    /// Convert a raw upload into a model input tensor.
    pub fn preprocess(&self, raw: &RawImage) -> Result<InputTensor, InvalidInputError> {
        if raw.is_empty() {
            return Err(InvalidInputError::Empty);
        }

        let image = self.decode(raw)?;
        let resized = image.resize_exact(self.width, self.height, RESIZE_FILTER);
        let data = self.normalize(&resized);

        InputTensor::new(self.output_shape(), data).ok_or_else(|| {
            InvalidInputError::Decode("decoded image does not match the model input shape".into())
        })
    }

    fn decode(&self, raw: &RawImage) -> Result<DynamicImage, InvalidInputError> {
        let mut reader = ImageReader::new(Cursor::new(raw.bytes.as_ref()))
            .with_guessed_format()
            .map_err(|e| InvalidInputError::Decode(e.to_string()))?;

        if reader.format().is_none() {
            return Err(InvalidInputError::UnsupportedFormat {
                declared: raw.content_type.clone(),
            });
        }

        let mut limits = Limits::default();
        limits.max_image_width = Some(self.max_dimension);
        limits.max_image_height = Some(self.max_dimension);
        reader.limits(limits);

        reader.decode().map_err(|e| match e {
            ImageError::Limits(limit) => InvalidInputError::TooLarge(limit.to_string()),
            ImageError::Unsupported(unsupported) => {
                tracing::debug!(error = %unsupported, "Unsupported image variant");
                InvalidInputError::UnsupportedFormat {
                    declared: raw.content_type.clone(),
                }
            }
            other => InvalidInputError::Decode(other.to_string()),
        })
    }

    /// Scale to [0, 1], apply per-channel normalization and lay out as CHW.
    fn normalize(&self, image: &DynamicImage) -> Vec<f32> {
        let num_pixels = (self.width * self.height) as usize;
        let channels = self.color.channels();
        let mut data = vec![0.0f32; channels * num_pixels];

        match self.color {
            ColorMode::Grayscale => {
                let luma = image.to_luma8();
                for (i, pixel) in luma.pixels().enumerate() {
                    data[i] = self.scale(pixel[0], 0);
                }
            }
            ColorMode::Rgb => {
                let rgb = image.to_rgb8();
                for (i, pixel) in rgb.pixels().enumerate() {
                    // all R values, then all G values, then all B values
                    for c in 0..3 {
                        data[c * num_pixels + i] = self.scale(pixel[c], c);
                    }
                }
            }
        }

        data
    }

    #[inline]
    fn scale(&self, value: u8, channel: usize) -> f32 {
        (value as f32 / 255.0 - self.mean[channel]) / self.std[channel]
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(&PreprocessingConfig::default())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};

    /// Encode a solid-colour image in the given format
    pub(crate) fn solid_image(width: u32, height: u32, rgb: [u8; 3], format: ImageFormat) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb(rgb));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img).write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }

    fn gradient_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x + y) % 256) as u8])
        });
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_output_shape_grayscale() {
        let pre = Preprocessor::default();
        let raw = RawImage::new(solid_image(64, 40, [10, 20, 30], ImageFormat::Png));

        let tensor = pre.preprocess(&raw).unwrap();
        assert_eq!(tensor.shape, [1, 1, 28, 28]);
        assert_eq!(tensor.data.len(), 28 * 28);
    }

    #[test]
    fn test_rgb_layout_is_channel_major() {
        let config = PreprocessingConfig {
            width: 4,
            height: 4,
            color: ColorMode::Rgb,
            mean: vec![0.0; 3],
            std: vec![1.0; 3],
            ..Default::default()
        };
        let pre = Preprocessor::new(&config);
        let raw = RawImage::new(solid_image(8, 8, [255, 0, 51], ImageFormat::Png));

        let tensor = pre.preprocess(&raw).unwrap();
        assert_eq!(tensor.shape, [1, 3, 4, 4]);
        assert!(tensor.data[..16].iter().all(|&v| (v - 1.0).abs() < 1e-6));
        assert!(tensor.data[16..32].iter().all(|&v| v.abs() < 1e-6));
        assert!(tensor.data[32..].iter().all(|&v| (v - 0.2).abs() < 1e-6));
    }

    #[test]
    fn test_normalization_applies_mean_and_std() {
        let config = PreprocessingConfig {
            width: 2,
            height: 2,
            mean: vec![0.5],
            std: vec![0.5],
            ..Default::default()
        };
        let pre = Preprocessor::new(&config);
        let raw = RawImage::new(solid_image(2, 2, [255, 255, 255], ImageFormat::Png));

        let tensor = pre.preprocess(&raw).unwrap();
        assert!(tensor.data.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_preprocess_is_deterministic() {
        let pre = Preprocessor::default();
        let bytes = gradient_png(97, 53);

        let first = pre.preprocess(&RawImage::new(bytes.clone())).unwrap();
        let second = pre.preprocess(&RawImage::new(bytes)).unwrap();

        let first_bits: Vec<u32> = first.data.iter().map(|v| v.to_bits()).collect();
        let second_bits: Vec<u32> = second.data.iter().map(|v| v.to_bits()).collect();
        assert_eq!(first_bits, second_bits);
    }

    #[test]
    fn test_jpeg_is_accepted() {
        let pre = Preprocessor::default();
        let raw = RawImage::new(solid_image(30, 30, [200, 200, 200], ImageFormat::Jpeg));
        assert!(pre.preprocess(&raw).is_ok());
    }

    #[test]
    fn test_empty_upload_is_rejected() {
        let pre = Preprocessor::default();
        let err = pre.preprocess(&RawImage::new(Vec::new())).unwrap_err();
        assert!(matches!(err, InvalidInputError::Empty));
    }

    #[test]
    fn test_text_is_rejected() {
        let pre = Preprocessor::default();
        let raw = RawImage::new(b"just some notes, not a picture".to_vec())
            .with_content_type("text/plain");

        let err = pre.preprocess(&raw).unwrap_err();
        assert!(matches!(
            err,
            InvalidInputError::UnsupportedFormat { declared: Some(ref ct) } if ct == "text/plain"
        ));
    }

    #[test]
    fn test_truncated_png_is_rejected() {
        let pre = Preprocessor::default();
        let mut bytes = gradient_png(40, 40);
        bytes.truncate(bytes.len() / 2);

        let err = pre.preprocess(&RawImage::new(bytes)).unwrap_err();
        assert!(matches!(err, InvalidInputError::Decode(_)));
    }

    #[test]
    fn test_oversized_image_is_rejected() {
        let config = PreprocessingConfig {
            max_decoded_dimension: 16,
            ..Default::default()
        };
        let pre = Preprocessor::new(&config);
        let raw = RawImage::new(solid_image(32, 8, [0, 0, 0], ImageFormat::Png));

        let err = pre.preprocess(&raw).unwrap_err();
        assert!(matches!(err, InvalidInputError::TooLarge(_)));
    }
}
