//! Near-duplicate photo finder core.
//!
//! Everything a gallery-attached duplicate finder needs below the UI:
//! a SQLite-backed [`photos::PhotoStore`] with streaming and counted
//! access, a resumable [`embed::pipeline::EmbeddingPipeline`] that turns
//! thumbnails into unit feature vectors, a seedable LSH index plus
//! [`group::Grouper`] that clusters near-duplicates inside a time window,
//! a persistent [`photos::SelectionSet`], and the HTTP client for the
//! remote auto-select service.
//!
//! Scraping the gallery, driving its deletion UI, and rendering results
//! are the embedding application's job; photos enter through
//! [`ingest::ingest_batch`] and decisions leave through the selection set.

pub mod db;
pub mod embed;
pub mod group;
pub mod ingest;
pub mod photos;
pub mod remote;
mod util;

pub use embed::pipeline::{EmbedProgress, EmbeddingPipeline, PipelineError};
pub use embed::{EmbedError, VisualEncoder, EMBEDDING_DIM};
pub use group::lsh::{LshConfig, LshIndex, LshStats};
pub use group::{Grouper, GroupingError, GroupingPhase, GroupingProgress, GroupingSummary};
pub use ingest::{ingest_batch, IncomingPhoto, IngestStats};
pub use photos::{
    GroupingSettings, MediaType, PageDirection, Photo, PhotoGroup, PhotoStore, ReviewStatus,
    SelectionSet, SettingsError, StoreError,
};
pub use remote::{ApiError, AutoSelectClient};
