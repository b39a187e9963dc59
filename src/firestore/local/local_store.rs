use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::firestore::core::{Query, Target};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::{
    BundleMetadata, FieldIndex, IndexOffset, LocalDocumentsView, NamedQuery, Persistence,
    PersistenceTransaction, QueryEngine, QueryEngineSettings, TargetData, TargetPurpose,
    TransactionMode,
};
use crate::firestore::model::{
    calculate_overlay_mutation, BatchId, DocumentKey, FieldMask, MutableDocument, Mutation,
    MutationBatch, MutationBatchResult, SnapshotVersion, TargetId, Timestamp, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::{RemoteEvent, TargetChange};

/// Resume tokens older than this are persisted even without document
/// changes.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

/// Result of running a query against the local cache.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryResult {
    /// Matching documents in query order, limit applied.
    pub documents: Vec<MutableDocument>,
    /// Keys the backend last reported for the query's target.
    pub remote_keys: BTreeSet<DocumentKey>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: BTreeMap<DocumentKey, MutableDocument>,
}

/// Keys a view started or stopped showing in one snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UserChangeResult {
    pub affected_documents: BTreeMap<DocumentKey, MutableDocument>,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

/// Turns a lost primary lease into `Ok(None)` after logging it; other
/// errors pass through.
pub fn ignore_if_primary_lease_loss<T>(result: FirestoreResult<T>) -> FirestoreResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(error) if error.is_primary_lease_lost() => {
            log::debug!("local store: unexpectedly lost primary lease: {error}");
            Ok(None)
        }
        Err(error) => Err(error),
    }
}

struct LocalStoreState {
    target_data_by_id: BTreeMap<TargetId, TargetData>,
    target_id_by_canonical_id: BTreeMap<String, TargetId>,
    current_user: Option<String>,
    query_engine: QueryEngine,
}

/// The client's single source of truth for locally known data: remote
/// documents with queued writes applied on top, plus the targets being
/// listened to.
pub struct LocalStore {
    persistence: Arc<dyn Persistence>,
    state: Mutex<LocalStoreState>,
}

impl LocalStore {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        settings: QueryEngineSettings,
        initial_user: Option<String>,
    ) -> Self {
        Self {
            persistence,
            state: Mutex::new(LocalStoreState {
                target_data_by_id: BTreeMap::new(),
                target_id_by_canonical_id: BTreeMap::new(),
                current_user: initial_user,
                query_engine: QueryEngine::new(settings),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, LocalStoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run<T>(
        &self,
        label: &'static str,
        mode: TransactionMode,
        body: impl FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<T>,
    ) -> FirestoreResult<T> {
        self.persistence.run(label, mode, body)
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn start(&self) -> FirestoreResult<()> {
        if !self.persistence.is_started() {
            self.persistence.start()?;
        }
        let user = self.state().current_user.clone();
        self.persistence.set_user(user);
        Ok(())
    }

    pub fn current_user(&self) -> Option<String> {
        self.state().current_user.clone()
    }

    pub fn set_index_auto_creation_enabled(&self, enabled: bool) {
        self.state().query_engine.set_index_auto_creation_enabled(enabled);
    }

    /// Switches to another user's mutation queue and reports which batches
    /// went away and which became visible.
    pub fn handle_user_change(&self, user: Option<String>) -> FirestoreResult<UserChangeResult> {
        let old_batches = self.run("Handle user change", TransactionMode::ReadOnly, |txn| {
            Ok(txn.mutation_queue.all_mutation_batches())
        })?;

        self.persistence.set_user(user.clone());
        self.state().current_user = user;

        self.run("Handle user change", TransactionMode::ReadWrite, |txn| {
            let new_batches = txn.mutation_queue.all_mutation_batches();
            let changed_keys: BTreeSet<DocumentKey> = old_batches
                .iter()
                .chain(new_batches.iter())
                .flat_map(MutationBatch::keys)
                .collect();
            let affected_documents = LocalDocumentsView::new(txn).get_documents(&changed_keys);
            Ok(UserChangeResult {
                affected_documents,
                removed_batch_ids: old_batches.iter().map(|batch| batch.batch_id).collect(),
                added_batch_ids: new_batches.iter().map(|batch| batch.batch_id).collect(),
            })
        })
    }

    /// Queues `mutations` as one batch and returns the documents as they
    /// look with the batch applied.
    pub fn write_locally(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: BTreeSet<DocumentKey> = mutations.iter().map(|mutation| mutation.key().clone()).collect();

        self.run("Locally write mutations", TransactionMode::ReadWrite, |txn| {
            let remote_documents = txn.remote_documents.get_entries(&keys);
            let without_remote_version: BTreeSet<DocumentKey> = remote_documents
                .iter()
                .filter(|(_, document)| !document.is_valid_document())
                .map(|(key, _)| key.clone())
                .collect();
            let mut overlayed =
                LocalDocumentsView::new(txn).get_overlayed_documents(remote_documents, &BTreeSet::new());

            // Non-idempotent transforms keep the base value they saw when the
            // write was issued.
            let mut base_mutations = Vec::new();
            for mutation in &mutations {
                let Some(current) = overlayed.get(mutation.key()) else {
                    continue;
                };
                if let Some(base_value) = mutation.extract_transform_base_value(&current.document) {
                    let mask = FieldMask::new(base_value.field_mask());
                    base_mutations.push(Mutation::patch(mutation.key().clone(), base_value, mask));
                }
            }

            let batch = txn
                .mutation_queue
                .add_mutation_batch(local_write_time, base_mutations, mutations.clone())?;
            for key in &keys {
                txn.index_manager
                    .add_to_collection_parent_index(&key.collection_path());
            }

            let mut overlays = BTreeMap::new();
            let mut changes = BTreeMap::new();
            for key in &keys {
                let Some(current) = overlayed.remove(key) else {
                    continue;
                };
                let (document, mask) = batch.apply_to_local_view(current.document, current.mutated_fields);
                let mask = if without_remote_version.contains(key) { None } else { mask };
                if let Some(overlay) = calculate_overlay_mutation(&document, mask.as_ref()) {
                    overlays.insert(key.clone(), overlay);
                }
                let document = if document.is_valid_document() {
                    document
                } else {
                    document.convert_to_no_document(SnapshotVersion::min())
                };
                changes.insert(key.clone(), document);
            }
            txn.overlays.save_overlays(batch.batch_id, overlays);

            log::debug!(
                "local store: wrote batch {} with {} mutations",
                batch.batch_id,
                batch.mutations.len()
            );
            Ok(LocalWriteResult {
                batch_id: batch.batch_id,
                changes,
            })
        })
    }

    /// Applies an acknowledged batch to the remote documents and drops it
    /// from the queue.
    pub fn acknowledge_batch(
        &self,
        batch_result: &MutationBatchResult,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        self.run("Acknowledge batch", TransactionMode::ReadWritePrimary, |txn| {
            let batch = &batch_result.batch;
            let affected = batch.keys();
            txn.mutation_queue
                .acknowledge_batch(batch, batch_result.stream_token.clone())?;

            for key in &affected {
                let document = txn.remote_documents.get_entry(key);
                let ack_version = batch_result.doc_versions.get(key).ok_or_else(|| {
                    internal_error(format!("No version for acknowledged document {key}"))
                })?;
                if document.version() < *ack_version {
                    let document = batch.apply_to_remote_document(document, batch_result);
                    if document.is_valid_document() {
                        add_remote_entry(txn, document, batch_result.commit_version)?;
                    }
                }
            }

            txn.mutation_queue.remove_mutation_batch(batch)?;
            for key in &affected {
                txn.references.remove_mutation_reference(key);
            }
            txn.overlays.remove_overlays_for_batch_id(batch.batch_id);

            let mut view = LocalDocumentsView::new(txn);
            view.recalculate_and_save_overlays_for_document_keys(&keys_with_transform_results(batch_result));
            Ok(view.get_documents(&affected))
        })
    }

    /// Drops a batch the backend refused and recomputes the affected local
    /// views from the remaining queue.
    pub fn reject_batch(&self, batch_id: BatchId) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        self.run("Reject batch", TransactionMode::ReadWritePrimary, |txn| {
            let batch = txn
                .mutation_queue
                .lookup_mutation_batch(batch_id)
                .ok_or_else(|| internal_error(format!("Attempt to reject nonexistent batch {batch_id}")))?;
            let affected = batch.keys();
            txn.mutation_queue.remove_mutation_batch(&batch)?;
            for key in &affected {
                txn.references.remove_mutation_reference(key);
            }
            txn.overlays.remove_overlays_for_batch_id(batch_id);

            let mut view = LocalDocumentsView::new(txn);
            view.recalculate_and_save_overlays_for_document_keys(&affected);
            Ok(view.get_documents(&affected))
        })
    }

    pub fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        self.run("Get highest unacknowledged batch id", TransactionMode::ReadOnly, |txn| {
            Ok(txn.mutation_queue.get_highest_unacknowledged_batch_id())
        })
    }

    /// First queued batch after `after_batch_id` (`None` starts at the head).
    pub fn next_mutation_batch(&self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
        let after = after_batch_id.unwrap_or(BATCH_ID_UNKNOWN);
        self.run("Get next mutation batch", TransactionMode::ReadOnly, |txn| {
            Ok(txn.mutation_queue.next_mutation_batch_after(after))
        })
    }

    pub fn get_last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        self.run("Get last stream token", TransactionMode::ReadOnly, |txn| {
            Ok(txn.mutation_queue.last_stream_token())
        })
    }

    pub fn set_last_stream_token(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        self.run("Set last stream token", TransactionMode::ReadWritePrimary, |txn| {
            txn.mutation_queue.set_last_stream_token(stream_token.clone());
            Ok(())
        })
    }

    pub fn read_document(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        self.run("Read document", TransactionMode::ReadOnly, |txn| {
            Ok(LocalDocumentsView::new(txn).get_document(key))
        })
    }

    pub fn get_last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        self.run("Get last remote snapshot version", TransactionMode::ReadOnly, |txn| {
            Ok(txn.targets.last_remote_snapshot_version())
        })
    }

    /// Applies a watch snapshot: target metadata and membership, then
    /// document updates that are newer than what the cache holds. Returns
    /// the changed documents as the user sees them.
    pub fn apply_remote_event(
        &self,
        event: &RemoteEvent,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let remote_version = event.snapshot_version;
        let known_targets = self.state().target_data_by_id.clone();

        let (changes, updated_targets) = self.run("Apply remote event", TransactionMode::ReadWritePrimary, |txn| {
            let mut updated_targets = BTreeMap::new();
            for (target_id, change) in &event.target_changes {
                let Some(old) = known_targets.get(target_id) else {
                    continue;
                };
                txn.targets
                    .remove_matching_keys(&change.removed_documents, *target_id);
                for key in &change.removed_documents {
                    txn.references.remove_reference(*target_id, key);
                }
                txn.targets.add_matching_keys(&change.added_documents, *target_id);
                for key in &change.added_documents {
                    txn.references.add_reference(*target_id, key);
                }

                let mismatched = event.target_mismatches.contains_key(target_id);
                let mut updated = old.clone().with_sequence_number(txn.sequence_number);
                if mismatched {
                    updated = updated
                        .with_resume_token(Vec::new(), SnapshotVersion::min())
                        .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                } else if !change.resume_token.is_empty() {
                    updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
                }
                if mismatched || should_persist_target_data(old, &updated, change) {
                    txn.targets.update_target_data(updated.clone())?;
                }
                updated_targets.insert(*target_id, updated);
            }

            for key in event.document_updates.keys() {
                if event.resolved_limbo_documents.contains(key) {
                    txn.references.update_limbo_document(key);
                }
            }

            let (changed, existence_changed) = populate_document_changes(txn, event)?;

            if !remote_version.is_min() {
                let last = txn.targets.last_remote_snapshot_version();
                if remote_version < last {
                    return Err(internal_error(format!(
                        "Watch stream reverted to previous snapshot? {remote_version} < {last}"
                    )));
                }
                txn.targets
                    .set_target_metadata(txn.sequence_number, Some(remote_version));
            }

            let documents =
                LocalDocumentsView::new(txn).get_local_view_of_documents(changed, &existence_changed);
            Ok((documents, updated_targets))
        })?;

        let mut state = self.state();
        for (target_id, target_data) in updated_targets {
            if let Some(entry) = state.target_data_by_id.get_mut(&target_id) {
                *entry = target_data;
            }
        }
        Ok(changes)
    }

    /// Pins documents shown by active views and advances the limbo-free
    /// snapshot version of views that are in sync.
    pub fn notify_local_view_changes(&self, view_changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        let known_targets = self.state().target_data_by_id.clone();
        let updated = self.run("Notify local view changes", TransactionMode::ReadWrite, |txn| {
            let mut updated = Vec::new();
            for change in view_changes {
                txn.references
                    .add_local_view_references(change.target_id, &change.added_keys);
                txn.references
                    .remove_local_view_references(change.target_id, &change.removed_keys);
                if change.from_cache {
                    continue;
                }
                if let Some(target_data) = known_targets.get(&change.target_id) {
                    let version = target_data.snapshot_version;
                    let target_data = target_data.clone().with_last_limbo_free_snapshot_version(version);
                    if txn.targets.get_target_data_for_id(change.target_id).is_some() {
                        txn.targets.update_target_data(target_data.clone())?;
                    }
                    updated.push(target_data);
                }
            }
            Ok(updated)
        })?;

        let mut state = self.state();
        for target_data in updated {
            if let Some(entry) = state.target_data_by_id.get_mut(&target_data.target_id) {
                *entry = target_data;
            }
        }
        Ok(())
    }

    /// Target data for `target`, reusing the cached entry when the target
    /// was listened to before.
    pub fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let target_data = self.run("Allocate target", TransactionMode::ReadWrite, |txn| {
            if let Some(cached) = txn.targets.get_target_data(&target) {
                return Ok(cached);
            }
            let target_id = txn.targets.allocate_target_id();
            let target_data = TargetData::new(target.clone(), target_id, TargetPurpose::Listen, txn.sequence_number);
            txn.targets.add_target_data(target_data.clone())?;
            Ok(target_data)
        })?;

        let mut state = self.state();
        let target_id = target_data.target_id;
        let entry = state
            .target_data_by_id
            .entry(target_id)
            .or_insert(target_data)
            .clone();
        state
            .target_id_by_canonical_id
            .insert(entry.target.canonical_id(), target_id);
        Ok(entry)
    }

    /// Active target data for `target`, if it is being listened to.
    pub fn get_local_target_data(&self, target: &Target) -> Option<TargetData> {
        let state = self.state();
        let target_id = state.target_id_by_canonical_id.get(&target.canonical_id())?;
        state.target_data_by_id.get(target_id).cloned()
    }

    pub fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        if let Some(target_data) = self.get_local_target_data(target) {
            return Ok(Some(target_data));
        }
        self.run("Get target data", TransactionMode::ReadOnly, |txn| {
            Ok(txn.targets.get_target_data(target))
        })
    }

    /// Stops tracking a target. Unless `keep_persisted_data` is set the
    /// target is removed from the cache and documents nothing else refers to
    /// are collected.
    pub fn release_target(&self, target_id: TargetId, keep_persisted_data: bool) -> FirestoreResult<()> {
        let target_data = self
            .state()
            .target_data_by_id
            .get(&target_id)
            .cloned()
            .ok_or_else(|| internal_error(format!("Tried to release nonexistent target {target_id}")))?;

        let mode = if keep_persisted_data {
            TransactionMode::ReadWrite
        } else {
            TransactionMode::ReadWritePrimary
        };
        let result = self.run("Release target", mode, |txn| {
            if keep_persisted_data {
                txn.targets.update_target_data(target_data.clone())?;
            } else {
                let keys = txn.targets.remove_matching_keys_for_target(target_id);
                txn.targets.remove_target_data(target_id);
                txn.references.remove_target(target_id, &keys);
            }
            txn.references
                .remove_local_view_references_for_target(target_id);
            Ok(())
        });
        ignore_if_primary_lease_loss(result)?;

        let mut state = self.state();
        state.target_data_by_id.remove(&target_id);
        state
            .target_id_by_canonical_id
            .remove(&target_data.target.canonical_id());
        Ok(())
    }

    /// Runs `query` against the cache. With `use_previous_results` the
    /// engine may re-derive the result from the target's remote keys.
    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let target = query.to_target();
        let local_target_data = self.get_local_target_data(&target);
        let query_engine = self.state().query_engine.clone();

        self.run("Execute query", TransactionMode::ReadWrite, |txn| {
            let target_data = local_target_data
                .clone()
                .or_else(|| txn.targets.get_target_data(&target));
            let (last_limbo_free, remote_keys) = match &target_data {
                Some(target_data) => (
                    target_data.last_limbo_free_snapshot_version,
                    txn.targets.get_matching_keys_for_target(target_data.target_id),
                ),
                None => (SnapshotVersion::min(), BTreeSet::new()),
            };
            let documents = if use_previous_results {
                query_engine.get_documents_matching_query(txn, query, last_limbo_free, &remote_keys)?
            } else {
                query_engine.get_documents_matching_query(txn, query, SnapshotVersion::min(), &BTreeSet::new())?
            };
            Ok(QueryResult {
                documents,
                remote_keys,
            })
        })
    }

    pub fn remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<BTreeSet<DocumentKey>> {
        self.run("Remote document keys", TransactionMode::ReadOnly, |txn| {
            Ok(txn.targets.get_matching_keys_for_target(target_id))
        })
    }

    /// Removes every cached document that no target, view or queued write
    /// refers to. Returns the number of removed documents.
    pub fn collect_garbage(&self) -> FirestoreResult<usize> {
        let before = self.run("Collect garbage", TransactionMode::ReadWritePrimary, |txn| {
            let keys = txn.remote_documents.document_keys();
            for key in &keys {
                txn.references.mark_potentially_orphaned(key);
            }
            Ok(keys.len())
        })?;
        let after = self.run("Collect garbage", TransactionMode::ReadOnly, |txn| {
            Ok(txn.remote_documents.size())
        })?;
        let removed = before.saturating_sub(after);
        if removed > 0 {
            log::debug!("local store: garbage collection removed {removed} documents");
        }
        Ok(removed)
    }

    /// Indexes up to `max_documents` documents of the collection group whose
    /// indexes were updated least recently.
    pub fn backfill_indexes(&self, max_documents: usize) -> FirestoreResult<usize> {
        self.run("Backfill indexes", TransactionMode::ReadWritePrimary, |txn| {
            let Some(group) = txn.index_manager.get_next_collection_group_to_update() else {
                return Ok(0);
            };
            let offset = txn
                .index_manager
                .get_field_indexes(Some(&group))
                .into_iter()
                .map(|index| index.offset)
                .min()
                .unwrap_or_else(IndexOffset::none);
            let documents = txn
                .remote_documents
                .get_all_from_collection_group(&group, &offset, max_documents);
            txn.index_manager.update_index_entries(&documents);
            let next_offset = documents
                .values()
                .map(IndexOffset::from_document)
                .max()
                .unwrap_or(offset);
            txn.index_manager.update_collection_group(&group, next_offset);
            log::debug!("local store: indexed {} documents of {group}", documents.len());
            Ok(documents.len())
        })
    }

    /// Replaces the configured field indexes with `indexes`.
    pub fn configure_field_indexes(&self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        self.run("Configure indexes", TransactionMode::ReadWrite, |txn| {
            let existing = txn.index_manager.get_field_indexes(None);
            let same = |left: &FieldIndex, right: &FieldIndex| {
                left.collection_group == right.collection_group && left.segments == right.segments
            };
            for index in &existing {
                if !indexes.iter().any(|wanted| same(wanted, index)) {
                    txn.index_manager.delete_field_index(index.index_id);
                }
            }
            for index in &indexes {
                if !existing.iter().any(|current| same(current, index)) {
                    txn.index_manager.add_field_index(index.clone())?;
                }
            }
            Ok(())
        })
    }

    pub fn delete_all_field_indexes(&self) -> FirestoreResult<()> {
        self.run("Delete all indexes", TransactionMode::ReadWrite, |txn| {
            txn.index_manager.delete_all_field_indexes();
            Ok(())
        })
    }

    /// Whether a bundle at least as new as `metadata` was loaded already.
    pub fn has_newer_bundle(&self, metadata: &BundleMetadata) -> FirestoreResult<bool> {
        self.run("Has newer bundle", TransactionMode::ReadOnly, |txn| {
            Ok(txn
                .bundles
                .get_bundle_metadata(&metadata.id)
                .map_or(false, |cached| cached.create_time >= metadata.create_time))
        })
    }

    pub fn save_bundle(&self, metadata: BundleMetadata) -> FirestoreResult<()> {
        self.run("Save bundle", TransactionMode::ReadWrite, |txn| {
            txn.bundles.save_bundle_metadata(metadata.clone());
            Ok(())
        })
    }

    pub fn save_named_query(&self, query: NamedQuery) -> FirestoreResult<()> {
        self.run("Save named query", TransactionMode::ReadWrite, |txn| {
            txn.bundles.save_named_query(query.clone());
            Ok(())
        })
    }

    pub fn get_named_query(&self, name: &str) -> FirestoreResult<Option<NamedQuery>> {
        self.run("Get named query", TransactionMode::ReadOnly, |txn| {
            Ok(txn.bundles.get_named_query(name))
        })
    }
}

fn add_remote_entry(
    txn: &mut PersistenceTransaction<'_>,
    document: MutableDocument,
    read_time: SnapshotVersion,
) -> FirestoreResult<()> {
    txn.index_manager
        .add_to_collection_parent_index(&document.key().collection_path());
    txn.remote_documents.add_entry(document, read_time)
}

/// Writes the event's document updates that are newer than the cached
/// state. Returns the written documents and the keys whose existence
/// flipped.
fn populate_document_changes(
    txn: &mut PersistenceTransaction<'_>,
    event: &RemoteEvent,
) -> FirestoreResult<(BTreeMap<DocumentKey, MutableDocument>, BTreeSet<DocumentKey>)> {
    // Members of a reset target are re-derived, so their versions may move
    // backwards.
    let reset_keys: BTreeSet<&DocumentKey> = event
        .target_mismatches
        .keys()
        .filter_map(|target_id| event.target_changes.get(target_id))
        .flat_map(|change| change.added_documents.iter().chain(change.modified_documents.iter()))
        .collect();

    let keys: BTreeSet<DocumentKey> = event.document_updates.keys().cloned().collect();
    let existing = txn.remote_documents.get_entries(&keys);
    let mut changed = BTreeMap::new();
    let mut existence_changed = BTreeSet::new();

    for (key, document) in &event.document_updates {
        let Some(existing_document) = existing.get(key) else {
            continue;
        };
        if document.is_found_document() != existing_document.is_found_document() {
            existence_changed.insert(key.clone());
        }

        if document.is_no_document() && document.version().is_min() {
            // A deletion at the zero version means the document is not known
            // to exist; there is nothing to keep.
            txn.remote_documents.remove_entry(key);
            changed.insert(key.clone(), document.clone());
        } else if !existing_document.is_valid_document()
            || document.version() > existing_document.version()
            || (document.version() == existing_document.version() && existing_document.has_pending_writes())
            || reset_keys.contains(key)
        {
            let read_time = if event.snapshot_version.is_min() {
                document.version()
            } else {
                event.snapshot_version
            };
            if read_time.is_min() {
                log::warn!("local store: ignoring update for {key} without a read time");
                continue;
            }
            add_remote_entry(txn, document.clone(), read_time)?;
            changed.insert(key.clone(), document.clone().set_read_time(read_time));
        } else {
            log::debug!(
                "local store: ignoring outdated watch update for {key}, current version {} new version {}",
                existing_document.version(),
                document.version()
            );
        }
    }
    Ok((changed, existence_changed))
}

fn should_persist_target_data(old: &TargetData, updated: &TargetData, change: &TargetChange) -> bool {
    if old.resume_token.is_empty() {
        return true;
    }
    let age = updated.snapshot_version.to_micros() - old.snapshot_version.to_micros();
    if age >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    change.document_count() > 0
}

fn keys_with_transform_results(batch_result: &MutationBatchResult) -> BTreeSet<DocumentKey> {
    batch_result
        .batch
        .mutations
        .iter()
        .zip(&batch_result.mutation_results)
        .filter(|(_, result)| !result.transform_results.is_empty())
        .map(|(mutation, _)| mutation.key().clone())
        .collect()
}
