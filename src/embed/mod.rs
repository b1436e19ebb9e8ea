pub mod pipeline;

#[cfg(feature = "local-embeddings")]
pub mod onnx;

/// Width of every feature vector this crate stores and compares.
pub const EMBEDDING_DIM: usize = 768;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbedError {
    /// The encoder could not be initialised (model download/compile).
    /// Surfaced to the caller; retried by invoking the pipeline again.
    #[error("model load failed: {0}")]
    ModelLoad(String),
    /// A single photo failed to embed. Recoverable: the pipeline logs the
    /// photo and moves on.
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Image bytes to unit-norm feature vector.
///
/// Implementations own the model and must make `init` idempotent: the
/// first call may block while the model is prepared, later calls return
/// immediately. `embed` must be deterministic for identical input bytes up
/// to the numeric backend's tolerance.
pub trait VisualEncoder: Send + Sync {
    fn init(&self) -> Result<(), EmbedError>;

    /// Returns an `EMBEDDING_DIM`-wide vector with unit L2 norm.
    fn embed(&self, bytes: &[u8]) -> Result<Vec<f32>, EmbedError>;
}

/// Scale `v` to unit L2 norm in place. Vectors with a vanishing norm are
/// left untouched rather than divided by ~0.
pub fn l2_normalize(v: &mut [f32]) {
    let sq_sum: f32 = v.iter().map(|x| x * x).sum();
    let magnitude = sq_sum.sqrt();
    if magnitude > 1e-6 {
        for x in v.iter_mut() {
            *x /= magnitude;
        }
    }
}

/// Dot product. Cosine similarity for unit vectors, which is all the
/// grouper ever feeds it.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
