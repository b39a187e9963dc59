use std::collections::BTreeSet;

use crate::firestore::local::{ReferenceDelegate, ReferenceSet};
use crate::firestore::model::{DocumentKey, TargetId};

/// Reference delegate that collects documents as soon as nothing refers to
/// them. Keys released during a transaction are remembered as orphan
/// candidates and re-checked when the transaction commits.
#[derive(Clone, Debug, Default)]
pub struct MemoryEagerDelegate {
    local_view_references: ReferenceSet,
    orphaned: BTreeSet<DocumentKey>,
}

impl MemoryEagerDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_referenced_by_local_view(&self, key: &DocumentKey) -> bool {
        self.local_view_references.contains_key(key)
    }

    pub fn take_orphaned(&mut self) -> BTreeSet<DocumentKey> {
        std::mem::take(&mut self.orphaned)
    }
}

impl ReferenceDelegate for MemoryEagerDelegate {
    fn add_reference(&mut self, _target_id: TargetId, key: &DocumentKey) {
        self.orphaned.remove(key);
    }

    fn remove_reference(&mut self, _target_id: TargetId, key: &DocumentKey) {
        self.orphaned.insert(key.clone());
    }

    fn remove_mutation_reference(&mut self, key: &DocumentKey) {
        self.orphaned.insert(key.clone());
    }

    fn remove_target(&mut self, _target_id: TargetId, keys: &BTreeSet<DocumentKey>) {
        self.orphaned.extend(keys.iter().cloned());
    }

    fn update_limbo_document(&mut self, key: &DocumentKey) {
        self.orphaned.insert(key.clone());
    }

    fn mark_potentially_orphaned(&mut self, key: &DocumentKey) {
        self.orphaned.insert(key.clone());
    }

    fn add_local_view_references(&mut self, target_id: TargetId, keys: &BTreeSet<DocumentKey>) {
        self.local_view_references.add_references(keys, target_id);
        for key in keys {
            self.orphaned.remove(key);
        }
    }

    fn remove_local_view_references(&mut self, target_id: TargetId, keys: &BTreeSet<DocumentKey>) {
        self.local_view_references.remove_references(keys, target_id);
        self.orphaned.extend(keys.iter().cloned());
    }

    fn remove_local_view_references_for_target(&mut self, target_id: TargetId) {
        let released = self.local_view_references.remove_references_for_id(target_id);
        self.orphaned.extend(released);
    }
}
