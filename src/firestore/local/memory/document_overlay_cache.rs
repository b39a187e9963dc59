use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::DocumentOverlayCache;
use crate::firestore::model::{BatchId, DocumentKey, Mutation, Overlay, ResourcePath};

#[derive(Clone, Debug, Default)]
pub struct MemoryDocumentOverlayCache {
    overlays: BTreeMap<DocumentKey, Overlay>,
    overlay_by_batch_id: BTreeMap<BatchId, BTreeSet<DocumentKey>>,
}

impl MemoryDocumentOverlayCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.overlays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.is_empty()
    }

    fn save_overlay(&mut self, largest_batch_id: BatchId, mutation: Mutation) {
        let key = mutation.key().clone();
        self.remove_overlay(&key);
        self.overlays
            .insert(key.clone(), Overlay::new(largest_batch_id, mutation));
        self.overlay_by_batch_id
            .entry(largest_batch_id)
            .or_default()
            .insert(key);
    }
}

impl DocumentOverlayCache for MemoryDocumentOverlayCache {
    fn get_overlay(&self, key: &DocumentKey) -> Option<Overlay> {
        self.overlays.get(key).cloned()
    }

    fn get_overlays(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, Overlay> {
        keys.iter()
            .filter_map(|key| self.overlays.get(key).map(|overlay| (key.clone(), overlay.clone())))
            .collect()
    }

    fn save_overlays(&mut self, largest_batch_id: BatchId, overlays: BTreeMap<DocumentKey, Mutation>) {
        for mutation in overlays.into_values() {
            self.save_overlay(largest_batch_id, mutation);
        }
    }

    fn remove_overlays_for_batch_id(&mut self, batch_id: BatchId) {
        if let Some(keys) = self.overlay_by_batch_id.remove(&batch_id) {
            for key in keys {
                self.overlays.remove(&key);
            }
        }
    }

    fn remove_overlay(&mut self, key: &DocumentKey) {
        let Some(existing) = self.overlays.remove(key) else {
            return;
        };
        let batch_id = existing.largest_batch_id;
        if let Some(keys) = self.overlay_by_batch_id.get_mut(&batch_id) {
            keys.remove(key);
            if keys.is_empty() {
                self.overlay_by_batch_id.remove(&batch_id);
            }
        }
    }

    fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay> {
        self.overlays
            .iter()
            .filter(|(key, overlay)| {
                collection.is_immediate_parent_of(key.path()) && overlay.largest_batch_id > since_batch_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }

    fn get_overlays_for_collection_group(
        &self,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let mut by_batch: BTreeMap<BatchId, Vec<&Overlay>> = BTreeMap::new();
        for overlay in self.overlays.values() {
            if overlay.key().has_collection_id(collection_group)
                && overlay.largest_batch_id > since_batch_id
            {
                by_batch.entry(overlay.largest_batch_id).or_default().push(overlay);
            }
        }

        let mut result = BTreeMap::new();
        for overlays in by_batch.into_values() {
            for overlay in overlays {
                result.insert(overlay.key().clone(), overlay.clone());
            }
            if result.len() >= count {
                break;
            }
        }
        result
    }
}
