use crate::embed::{l2_normalize, EmbedError, VisualEncoder, EMBEDDING_DIM};
use fastembed::{ImageEmbedding, ImageEmbeddingModel, ImageInitOptions};
use std::io::Write;
use std::sync::OnceLock;

/// ONNX-backed image encoder (Unicom ViT-B/16, 768-dim).
///
/// The model is loaded at most once per process; `init` on an already
/// initialised encoder is a no-op. First init may download weights.
pub struct OnnxEncoder {
    model: OnceLock<ImageEmbedding>,
}

impl OnnxEncoder {
    pub fn new() -> Self {
        Self {
            model: OnceLock::new(),
        }
    }
}

impl Default for OnnxEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VisualEncoder for OnnxEncoder {
    fn init(&self) -> Result<(), EmbedError> {
        if self.model.get().is_some() {
            return Ok(());
        }
        tracing::info!("onnx encoder: loading image embedding model");
        let model = ImageEmbedding::try_new(ImageInitOptions::new(
            ImageEmbeddingModel::UnicomVitB16,
        ))
        .map_err(|e| EmbedError::ModelLoad(e.to_string()))?;
        // Lost race with a concurrent init just means the other model wins.
        let _ = self.model.set(model);
        Ok(())
    }

    fn embed(&self, bytes: &[u8]) -> Result<Vec<f32>, EmbedError> {
        self.init()?;
        let model = self
            .model
            .get()
            .ok_or_else(|| EmbedError::ModelLoad("model not initialised".to_string()))?;

        // The model API consumes file paths, so stage the blob on disk.
        let mut staged = tempfile::Builder::new()
            .prefix("dupesweep-thumb-")
            .suffix(".jpg")
            .tempfile()
            .map_err(|e| EmbedError::Inference(e.to_string()))?;
        staged
            .write_all(bytes)
            .map_err(|e| EmbedError::Inference(e.to_string()))?;

        let mut vectors = model
            .embed(vec![staged.path().to_path_buf()], None)
            .map_err(|e| EmbedError::Inference(e.to_string()))?;
        let mut vector = vectors
            .pop()
            .ok_or_else(|| EmbedError::Inference("model returned no vector".to_string()))?;

        if vector.len() != EMBEDDING_DIM {
            return Err(EmbedError::Inference(format!(
                "expected {EMBEDDING_DIM}-dim vector, got {}",
                vector.len()
            )));
        }
        l2_normalize(&mut vector);
        Ok(vector)
    }
}
