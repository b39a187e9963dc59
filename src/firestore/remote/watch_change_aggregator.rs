use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::firestore::local::{TargetData, TargetPurpose};
use crate::firestore::model::{DatabaseId, DocumentKey, MutableDocument, SnapshotVersion, TargetId};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, TargetChangeState, WatchTargetChange,
};

/// What the aggregator needs to know about the targets it tracks.
pub trait TargetMetadataProvider: Send + Sync {
    /// Keys the local store currently associates with the target.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// `None` when the target is no longer listened to.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;

    fn database_id(&self) -> DatabaseId;
}

/// Outcome of using a bloom filter to repair an existence filter mismatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BloomFilterApplicationStatus {
    /// The removals brought the count in line with the backend.
    Success,
    /// No usable bloom filter.
    Skipped,
    /// Counts still differ, so some removed document produced a positive.
    FalsePositive,
}

/// Details of the last existence filter that disagreed with the local count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExistenceFilterMismatchInfo {
    pub target_id: TargetId,
    pub local_cache_count: usize,
    pub existence_filter_count: i32,
    pub bloom_filter_status: BloomFilterApplicationStatus,
    /// Purpose of the re-listen, `None` when the mismatch was repaired
    /// without one.
    pub reset_purpose: Option<TargetPurpose>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

struct TargetState {
    /// Add or remove requests sent but not acknowledged yet. Changes for a
    /// pending target are ignored.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    has_pending_changes: bool,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            // A new target always produces one change, so the view sees it.
            has_pending_changes: true,
        }
    }
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            match change_type {
                ChangeType::Added => change.added_documents.insert(key.clone()),
                ChangeType::Modified => change.modified_documents.insert(key.clone()),
                ChangeType::Removed => change.removed_documents.insert(key.clone()),
            };
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Accumulates watch changes between two consistent snapshots and turns
/// them into a [`RemoteEvent`].
pub struct WatchChangeAggregator {
    metadata: Arc<dyn TargetMetadataProvider>,
    target_states: HashMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Targets each pending document was reported for.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
    last_existence_filter_mismatch: Option<ExistenceFilterMismatchInfo>,
}

impl WatchChangeAggregator {
    pub fn new(metadata: Arc<dyn TargetMetadataProvider>) -> Self {
        Self {
            metadata,
            target_states: HashMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
            last_existence_filter_mismatch: None,
        }
    }

    pub fn handle_document_change(&mut self, change: DocumentWatchChange) {
        for target_id in &change.updated_target_ids {
            match &change.new_doc {
                Some(doc) if doc.is_found_document() => {
                    self.add_document_to_target(*target_id, doc.clone());
                }
                other => {
                    self.remove_document_from_target(*target_id, change.key.clone(), other.clone());
                }
            }
        }

        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(*target_id, change.key.clone(), change.new_doc.clone());
        }
    }

    /// Applies a target change. Only a removal with a cause rejects a
    /// listen, and the remote store routes those before they get here; a
    /// cause on any other state is ignored.
    pub fn handle_target_change(&mut self, change: &WatchTargetChange) {
        if let Some(cause) = &change.cause {
            log::warn!(
                "watch change aggregator: ignoring cause on {:?} change for targets {:?}: {cause}",
                change.state,
                change.target_ids
            );
        }
        for target_id in self.target_ids_for_change(change) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(target_id) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Add => {
                    // An add may be a response to an earlier remove request,
                    // so changes are only discarded once nothing is pending.
                    let state = self.ensure_target_state(target_id);
                    state.pending_responses -= 1;
                    if !state.is_pending() {
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Remove => {
                    let state = self.ensure_target_state(target_id);
                    state.pending_responses -= 1;
                    if !state.is_pending() {
                        self.target_states.remove(&target_id);
                    }
                }
                TargetChangeState::Current => {
                    if self.is_active_target(target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(target_id) {
                        self.reset_target(target_id);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Compares the backend count for a target with the local one and
    /// repairs or resets the target when they differ.
    pub fn handle_existence_filter(&mut self, change: &ExistenceFilterChange) {
        let target_id = change.target_id;
        let expected_count = change.existence_filter.count;
        let Some(target_data) = self.target_data_for_active_target(target_id) else {
            return;
        };

        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // The document is gone; synthesize its deletion since the
                // backend will not send one for a limbo target.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    let deleted = MutableDocument::new_no_document(key.clone(), SnapshotVersion::min());
                    self.remove_document_from_target(target_id, key, Some(deleted));
                }
            } else if expected_count != 1 {
                log::warn!(
                    "watch aggregator: single document target {target_id} reported {expected_count} documents"
                );
            }
            return;
        }

        let current_count = self.current_document_count_for_target(target_id);
        if current_count == expected_count.max(0) as usize {
            return;
        }

        let status = self.apply_bloom_filter(change, current_count);
        let reset_purpose = match status {
            BloomFilterApplicationStatus::Success => TargetPurpose::ExistenceFilterMismatchBloom,
            BloomFilterApplicationStatus::Skipped | BloomFilterApplicationStatus::FalsePositive => {
                self.reset_target(target_id);
                TargetPurpose::ExistenceFilterMismatch
            }
        };
        self.pending_target_resets.insert(target_id, reset_purpose);
        log::debug!(
            "watch aggregator: existence filter mismatch for target {target_id} (local {current_count}, remote {expected_count}, bloom filter {status:?})"
        );
        self.last_existence_filter_mismatch = Some(ExistenceFilterMismatchInfo {
            target_id,
            local_cache_count: current_count,
            existence_filter_count: expected_count,
            bloom_filter_status: status,
            reset_purpose: Some(reset_purpose),
        });
    }

    /// The most recent existence filter mismatch, for observation in tests
    /// and diagnostics.
    pub fn last_existence_filter_mismatch(&self) -> Option<&ExistenceFilterMismatchInfo> {
        self.last_existence_filter_mismatch.as_ref()
    }

    fn apply_bloom_filter(
        &mut self,
        change: &ExistenceFilterChange,
        current_count: usize,
    ) -> BloomFilterApplicationStatus {
        let Some(parameters) = change.existence_filter.unchanged_names.as_ref() else {
            return BloomFilterApplicationStatus::Skipped;
        };
        let bloom_filter = match BloomFilter::new(
            parameters.bitmap.clone(),
            parameters.padding,
            parameters.hash_count,
        ) {
            Ok(filter) => filter,
            Err(err) => {
                log::warn!("watch aggregator: ignoring malformed bloom filter: {err}");
                return BloomFilterApplicationStatus::Skipped;
            }
        };
        if bloom_filter.bit_count() == 0 {
            return BloomFilterApplicationStatus::Skipped;
        }

        let removed = self.filter_removed_documents(&bloom_filter, change.target_id);
        let expected = change.existence_filter.count.max(0) as usize;
        if current_count.saturating_sub(removed) == expected {
            BloomFilterApplicationStatus::Success
        } else {
            BloomFilterApplicationStatus::FalsePositive
        }
    }

    /// Removes every key the filter definitely does not contain. A positive
    /// answer never confirms membership, so those keys are left alone.
    fn filter_removed_documents(&mut self, bloom_filter: &BloomFilter, target_id: TargetId) -> usize {
        let database_id = self.metadata.database_id();
        let mut removed = 0;
        for key in self.metadata.get_remote_keys_for_target(target_id) {
            if !bloom_filter.might_contain(&database_id.document_name(&key)) {
                self.remove_document_from_target(target_id, key, None);
                removed += 1;
            }
        }
        removed
    }

    /// Drains everything accumulated so far into one event at
    /// `snapshot_version`.
    pub fn create_remote_event(&mut self, snapshot_version: SnapshotVersion) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();

        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .map(|state| state.current)
                .unwrap_or(false);

            if current && target_data.target.is_document_target() {
                // A current limbo target without the document means it does
                // not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    if !self.pending_document_updates.contains_key(&key)
                        && !self.target_contains_document(target_id, &key)
                    {
                        let deleted = MutableDocument::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, key, Some(deleted));
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo_targets = targets.iter().all(|target_id| {
                match self.target_data_for_active_target(*target_id) {
                    Some(target_data) => target_data.purpose == TargetPurpose::LimboResolution,
                    None => true,
                }
            });
            if only_limbo_targets {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let document_updates = std::mem::take(&mut self.pending_document_updates)
            .into_iter()
            .map(|(key, doc)| (key, doc.set_read_time(snapshot_version)))
            .collect();
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    /// Called when an add or remove request for `target_id` is sent.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).pending_responses += 1;
    }

    /// Drops the target's accumulated state after an unlisten.
    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn add_document_to_target(&mut self, target_id: TargetId, document: MutableDocument) {
        if !self.is_active_target(target_id) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(target_id, &key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_updates.insert(key, document);
    }

    /// `updated_document` is the new state when known (for example a
    /// deletion); `None` only removes the key from the target.
    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: DocumentKey,
        updated_document: Option<MutableDocument>,
    ) {
        if !self.is_active_target(target_id) {
            return;
        }
        if self.target_contains_document(target_id, &key) {
            self.ensure_target_state(target_id)
                .add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // The document was added in this snapshot; forget the add.
            self.ensure_target_state(target_id).remove_document_change(&key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key, document);
        }
    }

    fn reset_target(&mut self, target_id: TargetId) {
        self.target_states.insert(target_id, TargetState::default());
        for key in self.metadata.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, key, None);
        }
    }

    fn current_document_count_for_target(&mut self, target_id: TargetId) -> usize {
        let change = self.ensure_target_state(target_id).to_target_change();
        let remote_count = self.metadata.get_remote_keys_for_target(target_id).len();
        (remote_count + change.added_documents.len()).saturating_sub(change.removed_documents.len())
    }

    fn target_ids_for_change(&self, change: &WatchTargetChange) -> Vec<TargetId> {
        if change.target_ids.is_empty() {
            self.target_states.keys().copied().collect()
        } else {
            change.target_ids.clone()
        }
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    fn is_active_target(&self, target_id: TargetId) -> bool {
        self.target_data_for_active_target(target_id).is_some()
    }

    fn target_data_for_active_target(&self, target_id: TargetId) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => self.metadata.get_target_data_for_target(target_id),
        }
    }

    fn target_contains_document(&self, target_id: TargetId, key: &DocumentKey) -> bool {
        self.metadata
            .get_remote_keys_for_target(target_id)
            .contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Query, Target};
    use crate::firestore::error::permission_denied;
    use crate::firestore::model::ResourcePath;
    use crate::firestore::remote::watch_change::{BloomFilterParameters, ExistenceFilter};
    use crate::firestore::value::ObjectValue;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestMetadata {
        targets: Mutex<BTreeMap<TargetId, TargetData>>,
        remote_keys: Mutex<BTreeMap<TargetId, BTreeSet<DocumentKey>>>,
    }

    impl TestMetadata {
        fn with_query_target(self, target_id: TargetId, keys: &[&str]) -> Self {
            let target = Query::collection(ResourcePath::from_string("coll").unwrap()).to_target();
            self.add(target_id, target, TargetPurpose::Listen, keys)
        }

        fn with_limbo_target(self, target_id: TargetId, key: &str) -> Self {
            let target = Target::for_document(&doc_key(key));
            self.add(target_id, target, TargetPurpose::LimboResolution, &[])
        }

        fn add(self, target_id: TargetId, target: Target, purpose: TargetPurpose, keys: &[&str]) -> Self {
            self.targets
                .lock()
                .unwrap()
                .insert(target_id, TargetData::new(target, target_id, purpose, 1));
            self.remote_keys
                .lock()
                .unwrap()
                .insert(target_id, keys.iter().map(|key| doc_key(key)).collect());
            self
        }
    }

    impl TargetMetadataProvider for TestMetadata {
        fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.remote_keys
                .lock()
                .unwrap()
                .get(&target_id)
                .cloned()
                .unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.lock().unwrap().get(&target_id).cloned()
        }

        fn database_id(&self) -> DatabaseId {
            DatabaseId::default_for("p")
        }
    }

    fn doc_key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn found(path: &str, micros: i64) -> MutableDocument {
        MutableDocument::new_found_document(
            doc_key(path),
            SnapshotVersion::from_micros(micros),
            ObjectValue::empty(),
        )
    }

    fn version(micros: i64) -> SnapshotVersion {
        SnapshotVersion::from_micros(micros)
    }

    fn aggregator(metadata: TestMetadata) -> WatchChangeAggregator {
        WatchChangeAggregator::new(Arc::new(metadata))
    }

    fn filter(target_id: TargetId, count: i32, bloom: Option<BloomFilterParameters>) -> ExistenceFilterChange {
        ExistenceFilterChange {
            target_id,
            existence_filter: ExistenceFilter {
                count,
                unchanged_names: bloom,
            },
        }
    }

    #[test]
    fn classifies_document_changes_against_remote_keys() {
        let mut aggregator = aggregator(TestMetadata::default().with_query_target(2, &["coll/a"]));
        for (path, micros) in [("coll/a", 2), ("coll/b", 3)] {
            aggregator.handle_document_change(DocumentWatchChange {
                updated_target_ids: vec![2],
                removed_target_ids: vec![],
                key: doc_key(path),
                new_doc: Some(found(path, micros)),
            });
        }

        let event = aggregator.create_remote_event(version(10));
        let change = &event.target_changes[&2];
        assert!(change.modified_documents.contains(&doc_key("coll/a")));
        assert!(change.added_documents.contains(&doc_key("coll/b")));
        assert_eq!(event.document_updates.len(), 2);
        assert_eq!(event.document_updates[&doc_key("coll/b")].read_time(), version(10));
        assert!(event.resolved_limbo_documents.is_empty());
    }

    #[test]
    fn changes_for_pending_targets_are_ignored() {
        let mut aggregator = aggregator(TestMetadata::default().with_query_target(2, &[]));
        aggregator.record_pending_target_request(2);
        aggregator.handle_document_change(DocumentWatchChange {
            updated_target_ids: vec![2],
            removed_target_ids: vec![],
            key: doc_key("coll/a"),
            new_doc: Some(found("coll/a", 1)),
        });
        assert!(aggregator.create_remote_event(version(1)).document_updates.is_empty());

        aggregator.handle_target_change(&WatchTargetChange {
            state: TargetChangeState::Add,
            target_ids: vec![2],
            resume_token: vec![],
            read_time: SnapshotVersion::min(),
            cause: None,
        });
        aggregator.handle_document_change(DocumentWatchChange {
            updated_target_ids: vec![2],
            removed_target_ids: vec![],
            key: doc_key("coll/a"),
            new_doc: Some(found("coll/a", 1)),
        });
        let event = aggregator.create_remote_event(version(2));
        assert!(event.target_changes[&2].added_documents.contains(&doc_key("coll/a")));
    }

    #[test]
    fn hard_mismatch_without_bloom_filter_resets_the_target() {
        let mut aggregator =
            aggregator(TestMetadata::default().with_query_target(2, &["coll/a", "coll/b", "coll/c"]));
        aggregator.handle_existence_filter(&filter(2, 2, None));

        let event = aggregator.create_remote_event(version(5));
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );
        assert_eq!(event.target_changes[&2].removed_documents.len(), 3);
        let mismatch = aggregator.last_existence_filter_mismatch().unwrap();
        assert_eq!(mismatch.local_cache_count, 3);
        assert_eq!(mismatch.bloom_filter_status, BloomFilterApplicationStatus::Skipped);
    }

    #[test]
    fn matching_counts_are_trusted() {
        let mut aggregator = aggregator(TestMetadata::default().with_query_target(2, &["coll/a"]));
        aggregator.handle_existence_filter(&filter(2, 1, None));
        let event = aggregator.create_remote_event(version(5));
        assert!(event.target_mismatches.is_empty());
        assert!(aggregator.last_existence_filter_mismatch().is_none());
    }

    #[test]
    fn positive_bloom_answers_never_remove_documents() {
        let mut aggregator =
            aggregator(TestMetadata::default().with_query_target(2, &["coll/a", "coll/b", "coll/c"]));
        let everything = BloomFilterParameters {
            bitmap: vec![0xff; 8],
            padding: 0,
            hash_count: 3,
        };
        aggregator.handle_existence_filter(&filter(2, 2, Some(everything)));

        let mismatch = aggregator.last_existence_filter_mismatch().unwrap().clone();
        assert_eq!(mismatch.bloom_filter_status, BloomFilterApplicationStatus::FalsePositive);
        let event = aggregator.create_remote_event(version(5));
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );
    }

    #[test]
    fn negative_bloom_answers_remove_documents() {
        let mut aggregator =
            aggregator(TestMetadata::default().with_query_target(2, &["coll/a", "coll/b"]));
        let nothing = BloomFilterParameters {
            bitmap: vec![0; 8],
            padding: 0,
            hash_count: 3,
        };
        aggregator.handle_existence_filter(&filter(2, 0, Some(nothing)));

        let event = aggregator.create_remote_event(version(5));
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatchBloom)
        );
        assert_eq!(event.target_changes[&2].removed_documents.len(), 2);
    }

    #[test]
    fn malformed_bloom_filter_falls_back_to_reset() {
        let mut aggregator = aggregator(TestMetadata::default().with_query_target(2, &["coll/a"]));
        let malformed = BloomFilterParameters {
            bitmap: vec![1],
            padding: 9,
            hash_count: 1,
        };
        aggregator.handle_existence_filter(&filter(2, 0, Some(malformed)));
        let event = aggregator.create_remote_event(version(5));
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );
    }

    #[test]
    fn cause_on_a_non_removal_change_is_ignored() {
        let mut aggregator = aggregator(TestMetadata::default().with_query_target(2, &[]));
        aggregator.record_pending_target_request(2);
        for state in [TargetChangeState::Add, TargetChangeState::Current] {
            aggregator.handle_target_change(&WatchTargetChange {
                state,
                target_ids: vec![2],
                resume_token: vec![3],
                read_time: SnapshotVersion::min(),
                cause: Some(permission_denied("denied")),
            });
        }
        aggregator.handle_document_change(DocumentWatchChange {
            updated_target_ids: vec![2],
            removed_target_ids: vec![],
            key: doc_key("coll/a"),
            new_doc: Some(found("coll/a", 1)),
        });

        let event = aggregator.create_remote_event(version(4));
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.resume_token, vec![3]);
        assert!(change.added_documents.contains(&doc_key("coll/a")));
    }

    #[test]
    fn current_limbo_target_without_document_synthesizes_deletion() {
        let mut aggregator = aggregator(TestMetadata::default().with_limbo_target(1, "coll/gone"));
        aggregator.handle_target_change(&WatchTargetChange {
            state: TargetChangeState::Current,
            target_ids: vec![1],
            resume_token: vec![7],
            read_time: SnapshotVersion::min(),
            cause: None,
        });

        let event = aggregator.create_remote_event(version(9));
        let doc = &event.document_updates[&doc_key("coll/gone")];
        assert!(doc.is_no_document());
        assert_eq!(doc.version(), version(9));
        assert!(event.resolved_limbo_documents.contains(&doc_key("coll/gone")));
    }
}
