use std::collections::BTreeSet;

use crate::firestore::core::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::model::{BatchId, DocumentKey, Mutation, MutationBatch, Timestamp};

/// Queue of locally written batches not yet removed after acknowledgement
/// or rejection. Batches are kept in batch id order.
pub trait MutationQueue: Send {
    fn is_empty(&self) -> bool;

    /// Records the stream token of an acknowledgement. The batch itself is
    /// removed separately.
    fn acknowledge_batch(&mut self, batch: &MutationBatch, stream_token: Vec<u8>) -> FirestoreResult<()>;

    fn last_stream_token(&self) -> Vec<u8>;

    fn set_last_stream_token(&mut self, stream_token: Vec<u8>);

    fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch>;

    fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<MutationBatch>;

    /// First batch with an id greater than `batch_id`.
    fn next_mutation_batch_after(&self, batch_id: BatchId) -> Option<MutationBatch>;

    /// Largest queued batch id, or [`BATCH_ID_UNKNOWN`](crate::firestore::model::BATCH_ID_UNKNOWN).
    fn get_highest_unacknowledged_batch_id(&self) -> BatchId;

    fn all_mutation_batches(&self) -> Vec<MutationBatch>;

    fn all_mutation_batches_affecting_key(&self, key: &DocumentKey) -> Vec<MutationBatch>;

    fn all_mutation_batches_affecting_keys(&self, keys: &BTreeSet<DocumentKey>) -> Vec<MutationBatch>;

    fn all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<MutationBatch>;

    /// Removes a batch. Only the first queued batch may be removed.
    fn remove_mutation_batch(&mut self, batch: &MutationBatch) -> FirestoreResult<()>;

    fn contains_key(&self, key: &DocumentKey) -> bool;

    fn perform_consistency_check(&self) -> FirestoreResult<()>;
}
