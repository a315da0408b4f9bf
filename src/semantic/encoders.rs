//! Image and text encoders.
//!
//! The pipeline and the search coordinator only see the `ImageEncoder` and
//! `TextEncoder` traits. The default implementations wrap fastembed's CLIP
//! models, whose image and text towers share one embedding space.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Mutex;

use fastembed::{ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, TextEmbedding, TextInitOptions};
use image::{DynamicImage, ImageFormat};

/// Default CLIP vision tower
pub const DEFAULT_IMAGE_MODEL: &str = "Qdrant/clip-ViT-B-32-vision";
/// Default CLIP text tower, paired with `DEFAULT_IMAGE_MODEL`
pub const DEFAULT_TEXT_MODEL: &str = "Qdrant/clip-ViT-B-32-text";
/// Output dimensions of the default CLIP pair
pub const DEFAULT_DIMENSIONS: usize = 512;

/// Error type for encoder operations
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Encoding failed: {0}")]
    EncodeFailed(String),

    #[error("Encoder returned {got} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Turns images into embedding vectors.
pub trait ImageEncoder: Send + Sync {
    /// Prepare the model. Calling it again after success is a no-op.
    fn load_model(&self) -> Result<(), EncoderError>;

    /// Encode one image. Requires a successful `load_model`.
    fn encode(&self, image: &DynamicImage) -> Result<Vec<f32>, EncoderError>;

    fn dimensions(&self) -> usize;
}

/// Turns query text into embedding vectors in the image space.
pub trait TextEncoder: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<f32>, EncoderError>;
}

/// Where and how to load the fastembed models.
#[derive(Clone, Debug)]
pub struct ModelSettings {
    pub image_model: String,
    pub text_model: String,
    pub dimensions: usize,
    pub cache_dir: PathBuf,
}

impl ModelSettings {
    /// Compute SHA256 hash of the image model name for storage identification.
    pub fn model_id_hash(&self) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.image_model.as_bytes());
        hasher.finalize().into()
    }
}

/// CLIP vision encoder backed by fastembed.
///
/// The model is loaded on the first `load_model` call and kept for the
/// lifetime of the encoder. Uses a Mutex because fastembed's embed
/// functions require `&mut self`.
pub struct ClipImageEncoder {
    settings: ModelSettings,
    model: Mutex<Option<ImageEmbedding>>,
}

impl ClipImageEncoder {
    pub fn new(settings: ModelSettings) -> Self {
        Self {
            settings,
            model: Mutex::new(None),
        }
    }

    fn init(&self) -> Result<ImageEmbedding, EncoderError> {
        let model_enum = self
            .settings
            .image_model
            .parse::<ImageEmbeddingModel>()
            .map_err(|e| EncoderError::InvalidModel(format!("{}: {}", self.settings.image_model, e)))?;

        std::fs::create_dir_all(&self.settings.cache_dir).map_err(|e| {
            EncoderError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let options = ImageInitOptions::new(model_enum)
            .with_cache_dir(self.settings.cache_dir.clone())
            .with_show_download_progress(true);

        ImageEmbedding::try_new(options).map_err(|e| EncoderError::InitFailed(e.to_string()))
    }
}

impl ImageEncoder for ClipImageEncoder {
    fn load_model(&self) -> Result<(), EncoderError> {
        let mut guard = self.model.lock().map_err(|e| {
            EncoderError::InitFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        if guard.is_none() {
            log::info!("Loading image model '{}'", self.settings.image_model);
            *guard = Some(self.init()?);
        }

        Ok(())
    }

    fn encode(&self, image: &DynamicImage) -> Result<Vec<f32>, EncoderError> {
        // fastembed decodes and preprocesses on its own, hand it a lossless copy
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| EncoderError::EncodeFailed(format!("Failed to buffer image: {}", e)))?;

        let mut guard = self.model.lock().map_err(|e| {
            EncoderError::EncodeFailed(format!("Failed to acquire model lock: {}", e))
        })?;
        let model = guard
            .as_mut()
            .ok_or_else(|| EncoderError::EncodeFailed("Image model not loaded".to_string()))?;

        let embeddings = model
            .embed_bytes(&[png.as_slice()], None)
            .map_err(|e| EncoderError::EncodeFailed(e.to_string()))?;

        let vector = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EncoderError::EncodeFailed("No embedding returned".to_string()))?;

        check_dimensions(vector, self.settings.dimensions)
    }

    fn dimensions(&self) -> usize {
        self.settings.dimensions
    }
}

/// CLIP text encoder backed by fastembed. Loads lazily on first use.
pub struct ClipTextEncoder {
    settings: ModelSettings,
    model: Mutex<Option<TextEmbedding>>,
}

impl ClipTextEncoder {
    pub fn new(settings: ModelSettings) -> Self {
        Self {
            settings,
            model: Mutex::new(None),
        }
    }

    fn init(&self) -> Result<TextEmbedding, EncoderError> {
        let model_enum = self
            .settings
            .text_model
            .parse::<fastembed::EmbeddingModel>()
            .map_err(|e| EncoderError::InvalidModel(format!("{}: {}", self.settings.text_model, e)))?;

        std::fs::create_dir_all(&self.settings.cache_dir).map_err(|e| {
            EncoderError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let options = TextInitOptions::new(model_enum)
            .with_cache_dir(self.settings.cache_dir.clone())
            .with_show_download_progress(true);

        TextEmbedding::try_new(options).map_err(|e| EncoderError::InitFailed(e.to_string()))
    }
}

impl TextEncoder for ClipTextEncoder {
    fn encode(&self, text: &str) -> Result<Vec<f32>, EncoderError> {
        let mut guard = self.model.lock().map_err(|e| {
            EncoderError::EncodeFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        if guard.is_none() {
            log::info!("Loading text model '{}'", self.settings.text_model);
            *guard = Some(self.init()?);
        }
        let model = guard
            .as_mut()
            .ok_or_else(|| EncoderError::EncodeFailed("Text model not loaded".to_string()))?;

        let embeddings = model
            .embed(vec![text], None)
            .map_err(|e| EncoderError::EncodeFailed(e.to_string()))?;

        let vector = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EncoderError::EncodeFailed("No embedding returned".to_string()))?;

        check_dimensions(vector, self.settings.dimensions)
    }
}

fn check_dimensions(vector: Vec<f32>, expected: usize) -> Result<Vec<f32>, EncoderError> {
    if vector.len() != expected {
        return Err(EncoderError::DimensionMismatch {
            expected,
            got: vector.len(),
        });
    }
    Ok(vector)
}
