use crate::common::{Config, GateError, Result};
use crate::core::matcher::Embedding;
use ort::{Environment, Session, SessionBuilder, Value, GraphOptimizationLevel};
use std::path::Path;
use std::sync::Arc;
use image::{DynamicImage, imageops::FilterType};
use ndarray::{Array4, CowArray};

/// Turns a captured still into the embedding model's input tensor.
pub trait Preprocessor: Send + Sync {
    fn prepare(&self, still: &Path) -> Result<Array4<f32>>;
}

/// Opaque embedding model: normalised tensor in, fixed-length vector out.
pub trait EmbeddingModel: Send + Sync {
    fn embed(&self, tensor: Array4<f32>) -> Result<Embedding>;
}

#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    input_size: u32,
    normalization_value: f32,
    grayscale: bool,
}

impl ImagePreprocessor {
    pub fn new(config: &Config) -> Self {
        Self {
            input_size: config.recognizer.input_size,
            normalization_value: config.recognizer.normalization_value,
            grayscale: config.recognizer.grayscale,
        }
    }

    pub fn prepare_image(&self, image: &DynamicImage) -> Array4<f32> {
        let size = self.input_size;
        let resized = image.resize_exact(size, size, FilterType::Triangle);
        let norm = self.normalization_value;
        let size = size as usize;

        if self.grayscale {
            let gray = resized.to_luma8();
            let mut array = Array4::<f32>::zeros((1, 1, size, size));
            for (x, y, pixel) in gray.enumerate_pixels() {
                array[[0, 0, y as usize, x as usize]] = (pixel[0] as f32 - norm) / norm;
            }
            array
        } else {
            let rgb = resized.to_rgb8();
            let mut array = Array4::<f32>::zeros((1, 3, size, size));
            for (x, y, pixel) in rgb.enumerate_pixels() {
                for channel in 0..3 {
                    array[[0, channel, y as usize, x as usize]] = (pixel[channel] as f32 - norm) / norm;
                }
            }
            array
        }
    }
}

impl Preprocessor for ImagePreprocessor {
    fn prepare(&self, still: &Path) -> Result<Array4<f32>> {
        let image = image::open(still)?;
        Ok(self.prepare_image(&image))
    }
}

pub struct OnnxEmbedder {
    session: Session,
    _environment: Arc<Environment>,
}

impl OnnxEmbedder {
    pub fn new(config: &Config) -> Result<Self> {
        let environment = Arc::new(
            Environment::builder()
                .with_name("face_embedder")
                .build()
                .map_err(|e| GateError::Model(format!("Failed to create environment: {}", e)))?
        );

        let model_path = &config.models.recognizer_path;
        if !model_path.exists() {
            return Err(GateError::Model(
                format!("Recognition model not found at: {:?}", model_path)
            ));
        }

        let opt_level = match config.performance.optimization_level {
            0 => GraphOptimizationLevel::Disable,
            1 => GraphOptimizationLevel::Level1,
            2 => GraphOptimizationLevel::Level2,
            _ => GraphOptimizationLevel::Level3,
        };
        let session = SessionBuilder::new(&environment)?
            .with_optimization_level(opt_level)?
            .with_model_from_file(model_path)?;

        tracing::info!("Embedding model loaded from {:?}", model_path);

        Ok(Self { session, _environment: environment })
    }
}

impl EmbeddingModel for OnnxEmbedder {
    fn embed(&self, tensor: Array4<f32>) -> Result<Embedding> {
        let cow_array = CowArray::from(tensor.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;
        let outputs = self.session.run(vec![input_tensor])?;

        let first = outputs
            .first()
            .ok_or_else(|| GateError::Model("Embedding model produced no output".into()))?;
        let embedding = first.try_extract::<f32>()?.view().to_owned().into_raw_vec();
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma, Rgb};

    fn preprocessor(grayscale: bool) -> ImagePreprocessor {
        ImagePreprocessor { input_size: 8, normalization_value: 127.5, grayscale }
    }

    #[test]
    fn test_rgb_still_becomes_three_channel_tensor() {
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(32, 24, Rgb([255u8, 0, 127])));
        let tensor = preprocessor(false).prepare_image(&img);

        assert_eq!(tensor.shape(), &[1, 3, 8, 8]);
        assert!((tensor[[0, 0, 4, 4]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 4, 4]] + 1.0).abs() < 1e-6);
        assert!(tensor[[0, 2, 4, 4]].abs() < 0.01);
    }

    #[test]
    fn test_grayscale_tensor_is_single_channel_and_bounded() {
        let img = DynamicImage::ImageLuma8(ImageBuffer::from_fn(40, 40, |x, _| Luma([(x * 6) as u8])));
        let tensor = preprocessor(true).prepare_image(&img);

        assert_eq!(tensor.shape(), &[1, 1, 8, 8]);
        assert!(tensor.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_prepare_reads_still_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("still.png");
        DynamicImage::ImageRgb8(ImageBuffer::from_pixel(16, 16, Rgb([10u8, 20, 30])))
            .save(&path)
            .unwrap();

        let tensor = preprocessor(false).prepare(&path).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 8, 8]);
    }

    #[test]
    fn test_missing_still_is_an_error() {
        let result = preprocessor(false).prepare(Path::new("/nonexistent/still.jpg"));
        assert!(result.is_err());
    }
}
