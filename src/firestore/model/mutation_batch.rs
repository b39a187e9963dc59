use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    BatchId, DocumentKey, FieldMask, MutableDocument, Mutation, MutationResult, SnapshotVersion,
    Timestamp,
};

/// Batch id used before any batch was queued.
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// Mutations written together by one user call.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    /// Base values for non-idempotent transforms, applied before `mutations`
    /// in the local view only.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    /// Folds every mutation of this batch for the document's key, in order.
    pub fn apply_to_local_view(
        &self,
        mut document: MutableDocument,
        mut mask: Option<FieldMask>,
    ) -> (MutableDocument, Option<FieldMask>) {
        for mutation in self.base_mutations.iter().chain(self.mutations.iter()) {
            if mutation.key() == document.key() {
                (document, mask) =
                    mutation.apply_to_local_view(document, mask, self.local_write_time);
            }
        }
        (document, mask)
    }

    pub fn apply_to_remote_document(
        &self,
        mut document: MutableDocument,
        batch_result: &MutationBatchResult,
    ) -> MutableDocument {
        for (index, mutation) in self.mutations.iter().enumerate() {
            if mutation.key() != document.key() {
                continue;
            }
            if let Some(result) = batch_result.mutation_results.get(index) {
                document = mutation.apply_to_remote_document(document, result);
            }
        }
        document
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    pub fn affects_key(&self, key: &DocumentKey) -> bool {
        self.mutations.iter().any(|mutation| mutation.key() == key)
    }
}

/// Backend acknowledgement of a whole batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version of each written document as reported by the backend.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}
