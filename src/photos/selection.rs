use crate::photos::model::SelectionEntry;
use crate::photos::store::{PhotoStore, StoreError};
use std::sync::Arc;

/// The set of photos the user has marked for deletion.
///
/// Thin façade over the store's `selected_photos` table: membership checks
/// and counts are single queries, and iteration is batched so a deletion
/// workflow can walk a six-figure selection without holding it in memory.
pub struct SelectionSet {
    store: Arc<PhotoStore>,
}

impl SelectionSet {
    pub fn new(store: Arc<PhotoStore>) -> Self {
        Self { store }
    }

    pub fn select(&self, photo_id: &str) -> Result<(), StoreError> {
        self.store.select(photo_id)
    }

    pub fn unselect(&self, photo_id: &str) -> Result<(), StoreError> {
        self.store.unselect(photo_id)
    }

    pub fn is_selected(&self, photo_id: &str) -> Result<bool, StoreError> {
        self.store.is_selected(photo_id)
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        self.store.selection_count()
    }

    pub fn page(&self, offset: u64, limit: u64) -> Result<Vec<SelectionEntry>, StoreError> {
        self.store.selection_page(offset, limit)
    }

    /// Visit every selection entry in batches of `batch_size`.
    pub fn for_each_batch<E, F>(&self, batch_size: usize, f: F) -> Result<(), E>
    where
        F: FnMut(&[SelectionEntry]) -> Result<(), E>,
        E: From<StoreError>,
    {
        self.store.for_each_selection(batch_size, f)
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.store.clear_selection()
    }
}
