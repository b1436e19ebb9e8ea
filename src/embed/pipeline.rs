use crate::embed::{EmbedError, VisualEncoder};
use crate::photos::store::{PhotoStore, StoreError, LAST_EMBEDDING_TIME_KEY};
use crate::util::RunGuard;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("embedding pipeline is already running")]
    Busy,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Embed(#[from] EmbedError),
}

/// Progress snapshot delivered after every processed photo.
#[derive(Debug, Clone)]
pub struct EmbedProgress {
    pub current: usize,
    pub total: usize,
    pub message: String,
}

/// Walks photos that have no embedding yet, computes one per photo, and
/// persists it together with the `has_embedding` flip in one transaction.
///
/// Resumable by construction: already-done photos carry the flag, so a
/// crashed or restarted run simply continues with whatever is left. At most
/// one run at a time; a second caller gets `PipelineError::Busy` instead of
/// racing.
pub struct EmbeddingPipeline {
    store: Arc<PhotoStore>,
    encoder: Arc<dyn VisualEncoder>,
    batch_size: usize,
    running: AtomicBool,
}

impl EmbeddingPipeline {
    pub fn new(store: Arc<PhotoStore>, encoder: Arc<dyn VisualEncoder>) -> Self {
        Self {
            store,
            encoder,
            batch_size: DEFAULT_BATCH_SIZE,
            running: AtomicBool::new(false),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run the pipeline to completion. Returns the number of photos newly
    /// embedded by this invocation (skipped failures are not counted).
    pub fn run<F>(&self, mut progress: F) -> Result<usize, PipelineError>
    where
        F: FnMut(&EmbedProgress),
    {
        let _guard = RunGuard::acquire(&self.running).ok_or(PipelineError::Busy)?;

        self.encoder.init()?;

        let total = self.store.count_unembedded()? as usize;
        tracing::info!("embedding pipeline: {} photos queued", total);

        let mut current = 0usize;
        let mut embedded = 0usize;

        self.store
            .for_each_unembedded_batch::<PipelineError, _>(self.batch_size, |batch| {
                for photo in batch {
                    match self.encoder.embed(&photo.blob) {
                        Ok(vector) => {
                            self.store.put_embedding(&photo.id, &vector)?;
                            embedded += 1;
                        }
                        Err(EmbedError::Inference(reason)) => {
                            // One bad photo never stops the queue.
                            tracing::warn!(
                                "embedding pipeline: skipping photo {}: {}",
                                photo.id,
                                reason
                            );
                        }
                        Err(err @ EmbedError::ModelLoad(_)) => return Err(err.into()),
                    }
                    current += 1;
                    progress(&EmbedProgress {
                        current,
                        total,
                        message: format!("Embedded {current} of {total} photos"),
                    });
                }
                Ok(())
            })?;

        self.store.set_metadata(
            LAST_EMBEDDING_TIME_KEY,
            &chrono::Utc::now().timestamp_millis().to_string(),
        )?;
        tracing::info!(
            "embedding pipeline: complete, {} newly embedded ({} visited)",
            embedded,
            current
        );
        Ok(embedded)
    }
}
