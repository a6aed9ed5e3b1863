use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView};
use ndarray::Array4;
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

pub type EmbeddingVector = Vec<f32>;

pub const CLIP_INPUT_SIZE: u32 = 224;
pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("Image could not be read: {0}")]
    Image(#[from] image::ImageError),

    #[error("Model error: {0}")]
    Model(#[from] ort::Error),

    #[error("Model file not found: {path}")]
    ModelNotFound { path: PathBuf },

    #[error("Model produced no output")]
    EmptyOutput,

    #[error("Embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding worker failed: {0}")]
    Worker(String),

    #[error("Model lock poisoned by an earlier panic")]
    Poisoned,
}

/// A pretrained image model. Takes `&mut self` because an inference call may hold
/// per-call device state; callers go through [`EmbeddingGenerator`], which serializes
/// access.
pub trait ImageEmbedder: Send {
    fn embed(&mut self, image: &DynamicImage) -> Result<EmbeddingVector, EmbeddingError>;
}

struct ModelSlot {
    embedder: Box<dyn ImageEmbedder>,
    dimension: Option<usize>,
}

/// Process-wide embedding service. Built once at startup and shared behind an `Arc`;
/// inference runs one call at a time through the inner mutex.
pub struct EmbeddingGenerator {
    model: Mutex<ModelSlot>,
}

impl EmbeddingGenerator {
    pub fn new(embedder: impl ImageEmbedder + 'static) -> Self {
        Self {
            model: Mutex::new(ModelSlot {
                embedder: Box::new(embedder),
                dimension: None,
            }),
        }
    }

    /// Dimensionality fixed by the first successful embedding of this run.
    pub fn dimension(&self) -> Option<usize> {
        self.model.lock().ok().and_then(|slot| slot.dimension)
    }

    pub fn embed_file(&self, path: &Path) -> Result<EmbeddingVector, EmbeddingError> {
        let image = image::open(path)?;
        self.embed_image(&image)
    }

    pub fn embed_image(&self, image: &DynamicImage) -> Result<EmbeddingVector, EmbeddingError> {
        let mut slot = self.model.lock().map_err(|_| EmbeddingError::Poisoned)?;
        let vector = slot.embedder.embed(image)?;

        if vector.is_empty() {
            return Err(EmbeddingError::EmptyOutput);
        }

        match slot.dimension {
            Some(expected) if expected != vector.len() => Err(EmbeddingError::DimensionMismatch {
                expected,
                actual: vector.len(),
            }),
            Some(_) => Ok(vector),
            None => {
                slot.dimension = Some(vector.len());
                Ok(vector)
            }
        }
    }
}

/// CLIP image preprocessing: shortest side resized to `size` (bicubic), center crop,
/// per-channel normalization, NCHW layout with a batch of one.
pub fn clip_tensor(image: &DynamicImage, size: u32) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let scale = size as f32 / width.min(height).max(1) as f32;
    let resized_w = ((width as f32 * scale).round() as u32).max(size);
    let resized_h = ((height as f32 * scale).round() as u32).max(size);

    let resized = image
        .resize_exact(resized_w, resized_h, FilterType::CatmullRom)
        .to_rgb8();
    let left = (resized_w - size) / 2;
    let top = (resized_h - size) / 2;
    let cropped = imageops::crop_imm(&resized, left, top, size, size).to_image();

    Array4::from_shape_fn(
        (1, 3, size as usize, size as usize),
        |(_, channel, y, x)| {
            let value = cropped.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0;
            (value - CLIP_MEAN[channel]) / CLIP_STD[channel]
        },
    )
}

/// CLIP visual encoder exported to ONNX (e.g. ViT-B/32, 512-dimensional output).
pub struct ClipOnnxEmbedder {
    session: Session,
    input_name: String,
    output_name: String,
    input_size: u32,
}

impl ClipOnnxEmbedder {
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, EmbeddingError> {
        if !model_path.is_file() {
            return Err(EmbeddingError::ModelNotFound {
                path: model_path.to_path_buf(),
            });
        }

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads.max(1))?
            .commit_from_file(model_path)?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or(EmbeddingError::EmptyOutput)?;
        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or(EmbeddingError::EmptyOutput)?;

        log::info!(
            "Loaded embedding model {} (input `{}`, output `{}`)",
            model_path.display(),
            input_name,
            output_name
        );

        Ok(Self {
            session,
            input_name,
            output_name,
            input_size: CLIP_INPUT_SIZE,
        })
    }
}

impl ImageEmbedder for ClipOnnxEmbedder {
    fn embed(&mut self, image: &DynamicImage) -> Result<EmbeddingVector, EmbeddingError> {
        let input = clip_tensor(image, self.input_size);
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input.view()]?)?;
        let embedding = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
        Ok(embedding.iter().copied().collect())
    }
}
