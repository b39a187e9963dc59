use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::{Target, TargetIdGenerator};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::{ReferenceSet, TargetCache, TargetData};
use crate::firestore::model::{DocumentKey, ListenSequenceNumber, SnapshotVersion, TargetId};

#[derive(Clone, Debug)]
pub struct MemoryTargetCache {
    /// Keyed by canonical id.
    targets: BTreeMap<String, TargetData>,
    last_remote_snapshot_version: SnapshotVersion,
    highest_target_id: TargetId,
    highest_sequence_number: ListenSequenceNumber,
    references: ReferenceSet,
    generator: TargetIdGenerator,
}

impl Default for MemoryTargetCache {
    fn default() -> Self {
        Self {
            targets: BTreeMap::new(),
            last_remote_snapshot_version: SnapshotVersion::min(),
            highest_target_id: 0,
            highest_sequence_number: 0,
            references: ReferenceSet::new(),
            generator: TargetIdGenerator::for_target_cache(0),
        }
    }
}

impl MemoryTargetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target_ids(&self) -> Vec<TargetId> {
        self.targets.values().map(|data| data.target_id).collect()
    }

    fn save_target_data(&mut self, target_data: TargetData) {
        if target_data.target_id > self.highest_target_id {
            self.generator = TargetIdGenerator::for_target_cache(target_data.target_id);
            self.highest_target_id = target_data.target_id;
        }
        if target_data.sequence_number > self.highest_sequence_number {
            self.highest_sequence_number = target_data.sequence_number;
        }
        self.targets
            .insert(target_data.target.canonical_id(), target_data);
    }
}

impl TargetCache for MemoryTargetCache {
    fn highest_target_id(&self) -> TargetId {
        self.highest_target_id
    }

    fn highest_listen_sequence_number(&self) -> ListenSequenceNumber {
        self.highest_sequence_number
    }

    fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.last_remote_snapshot_version
    }

    fn set_target_metadata(
        &mut self,
        highest_listen_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: Option<SnapshotVersion>,
    ) {
        if let Some(version) = last_remote_snapshot_version {
            self.last_remote_snapshot_version = version;
        }
        if highest_listen_sequence_number > self.highest_sequence_number {
            self.highest_sequence_number = highest_listen_sequence_number;
        }
    }

    fn add_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()> {
        let canonical_id = target_data.target.canonical_id();
        if self.targets.contains_key(&canonical_id) {
            return Err(internal_error(format!(
                "Adding a target that already exists: {canonical_id}"
            )));
        }
        self.save_target_data(target_data);
        Ok(())
    }

    fn update_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()> {
        let canonical_id = target_data.target.canonical_id();
        if !self.targets.contains_key(&canonical_id) {
            return Err(internal_error(format!(
                "Updating a target that does not exist: {canonical_id}"
            )));
        }
        self.save_target_data(target_data);
        Ok(())
    }

    fn remove_target_data(&mut self, target_id: TargetId) {
        self.targets.retain(|_, data| data.target_id != target_id);
        self.references.remove_references_for_id(target_id);
    }

    fn get_target_data(&self, target: &Target) -> Option<TargetData> {
        self.targets.get(&target.canonical_id()).cloned()
    }

    fn get_target_data_for_id(&self, target_id: TargetId) -> Option<TargetData> {
        self.targets
            .values()
            .find(|data| data.target_id == target_id)
            .cloned()
    }

    fn target_count(&self) -> usize {
        self.targets.len()
    }

    fn allocate_target_id(&mut self) -> TargetId {
        self.highest_target_id = self.generator.next();
        self.highest_target_id
    }

    fn add_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: TargetId) {
        self.references.add_references(keys, target_id);
    }

    fn remove_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: TargetId) {
        self.references.remove_references(keys, target_id);
    }

    fn remove_matching_keys_for_target(&mut self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.references.remove_references_for_id(target_id)
    }

    fn get_matching_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.references.references_for_id(target_id)
    }

    fn contains_key(&self, key: &DocumentKey) -> bool {
        self.references.contains_key(key)
    }
}
