pub mod model;
pub mod selection;
pub mod store;

pub use model::{
    AiConfidence, GroupingSettings, MediaType, PageDirection, Photo, PhotoGroup, ReviewStatus,
    SelectionEntry, SettingsError, StoredEmbedding,
};
pub use selection::SelectionSet;
pub use store::{PhotoStore, StoreError};
