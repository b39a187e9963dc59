use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::model::{BatchId, DocumentKey, Mutation, Overlay, ResourcePath};

/// Saved overlays, at most one per key.
pub trait DocumentOverlayCache: Send {
    fn get_overlay(&self, key: &DocumentKey) -> Option<Overlay>;

    fn get_overlays(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, Overlay>;

    /// Saves overlays produced by batches up to `largest_batch_id`,
    /// replacing earlier overlays for the same keys.
    fn save_overlays(&mut self, largest_batch_id: BatchId, overlays: BTreeMap<DocumentKey, Mutation>);

    fn remove_overlays_for_batch_id(&mut self, batch_id: BatchId);

    fn remove_overlay(&mut self, key: &DocumentKey);

    /// Overlays of documents directly in `collection` with a batch id
    /// greater than `since_batch_id`.
    fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay>;

    /// Overlays of a collection group with a batch id greater than
    /// `since_batch_id`, in batch order. Always returns whole batches, even
    /// when that exceeds `count`.
    fn get_overlays_for_collection_group(
        &self,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> BTreeMap<DocumentKey, Overlay>;
}
