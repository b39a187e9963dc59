use std::collections::BTreeSet;

use crate::firestore::core::Target;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::TargetData;
use crate::firestore::model::{DocumentKey, ListenSequenceNumber, SnapshotVersion, TargetId};

/// Persisted targets and the document keys the backend reported for each.
pub trait TargetCache: Send {
    fn highest_target_id(&self) -> TargetId;

    fn highest_listen_sequence_number(&self) -> ListenSequenceNumber;

    fn last_remote_snapshot_version(&self) -> SnapshotVersion;

    fn set_target_metadata(
        &mut self,
        highest_listen_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: Option<SnapshotVersion>,
    );

    /// Adds a target that is not in the cache yet.
    fn add_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()>;

    /// Replaces the data of a cached target.
    fn update_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()>;

    fn remove_target_data(&mut self, target_id: TargetId);

    fn get_target_data(&self, target: &Target) -> Option<TargetData>;

    fn get_target_data_for_id(&self, target_id: TargetId) -> Option<TargetData>;

    fn target_count(&self) -> usize;

    /// Next even target id above every id handed out so far.
    fn allocate_target_id(&mut self) -> TargetId;

    fn add_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: TargetId);

    fn remove_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: TargetId);

    fn remove_matching_keys_for_target(&mut self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    fn get_matching_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    fn contains_key(&self, key: &DocumentKey) -> bool;
}
