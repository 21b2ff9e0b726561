//! Offline multimodal embedding backend.
//!
//! Joint text/image CLIP space via fastembed. Both halves embed into the
//! same 512-dim space, so a text query compares directly against image
//! vectors. Models are downloaded on first use and cached under the base
//! dir. Mutexes because fastembed's embed() takes &mut self.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fastembed::{
    EmbeddingModel, ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions,
    TextEmbedding,
};

use crate::embed::{EmbedBackend, EmbedError};

pub const BACKEND_ID: &str = "offline:clip-vit-b-32";

pub struct OfflineMultimodalEmbedder {
    text_model: Mutex<TextEmbedding>,
    image_model: Mutex<ImageEmbedding>,
    dimensions: usize,
}

impl OfflineMultimodalEmbedder {
    /// Load (or download) both CLIP halves. Any init failure is a
    /// configuration error so the ladder can fall through to the hash
    /// backend.
    pub fn new(base_dir: &Path) -> Result<Self, EmbedError> {
        let models_dir: PathBuf = base_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbedError::Configuration(format!("failed to create models directory: {e}"))
        })?;

        let text_options = InitOptions::new(EmbeddingModel::ClipVitB32)
            .with_cache_dir(models_dir.clone())
            .with_show_download_progress(true);
        let mut text_model = TextEmbedding::try_new(text_options)
            .map_err(|e| EmbedError::Configuration(e.to_string()))?;

        let image_options = ImageInitOptions::new(ImageEmbeddingModel::ClipVitB32)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);
        let image_model = ImageEmbedding::try_new(image_options)
            .map_err(|e| EmbedError::Configuration(e.to_string()))?;

        let dimensions = Self::probe_dimensions(&mut text_model)?;

        Ok(Self {
            text_model: Mutex::new(text_model),
            image_model: Mutex::new(image_model),
            dimensions,
        })
    }

    /// Probe the text model to determine embedding dimensions.
    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbedError> {
        let probe = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbedError::Configuration(format!("failed to probe dimensions: {e}")))?;

        probe
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbedError::Configuration("model returned no embedding".to_string()))
    }
}

impl EmbedBackend for OfflineMultimodalEmbedder {
    fn id(&self) -> &str {
        BACKEND_ID
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut model = self
            .text_model
            .lock()
            .map_err(|e| EmbedError::Engine(format!("failed to acquire model lock: {e}")))?;

        let embeddings = model
            .embed(vec![text], None)
            .map_err(|e| EmbedError::Engine(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::Engine("no embedding returned".to_string()))
    }

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>, EmbedError> {
        let mut model = self
            .image_model
            .lock()
            .map_err(|e| EmbedError::Engine(format!("failed to acquire model lock: {e}")))?;

        let embeddings = model
            .embed(vec![path], None)
            .map_err(|e| EmbedError::Engine(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::Engine("no embedding returned".to_string()))
    }
}
