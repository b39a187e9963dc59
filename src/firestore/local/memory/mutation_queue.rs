use std::collections::BTreeSet;

use crate::firestore::core::Query;
use crate::firestore::error::{internal_error, invalid_argument, FirestoreResult};
use crate::firestore::local::{MutationQueue, ReferenceSet};
use crate::firestore::model::{
    BatchId, DocumentKey, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN,
};

#[derive(Clone, Debug)]
pub struct MemoryMutationQueue {
    queue: Vec<MutationBatch>,
    next_batch_id: BatchId,
    last_stream_token: Vec<u8>,
    batches_by_document_key: ReferenceSet,
}

impl Default for MemoryMutationQueue {
    fn default() -> Self {
        Self {
            queue: Vec::new(),
            next_batch_id: 1,
            last_stream_token: Vec::new(),
            batches_by_document_key: ReferenceSet::new(),
        }
    }
}

impl MemoryMutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn index_of_batch_id(&self, batch_id: BatchId) -> Option<usize> {
        self.queue
            .binary_search_by(|batch| batch.batch_id.cmp(&batch_id))
            .ok()
    }

    fn batches_for_ids(&self, ids: impl IntoIterator<Item = BatchId>) -> Vec<MutationBatch> {
        let ids: BTreeSet<BatchId> = ids.into_iter().collect();
        ids.into_iter()
            .filter_map(|id| self.lookup_mutation_batch(id))
            .collect()
    }
}

impl MutationQueue for MemoryMutationQueue {
    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn acknowledge_batch(&mut self, batch: &MutationBatch, stream_token: Vec<u8>) -> FirestoreResult<()> {
        match self.queue.first() {
            Some(first) if first.batch_id == batch.batch_id => {
                self.last_stream_token = stream_token;
                Ok(())
            }
            _ => Err(internal_error(format!(
                "Can only acknowledge the first batch in the mutation queue, got {}",
                batch.batch_id
            ))),
        }
    }

    fn last_stream_token(&self) -> Vec<u8> {
        self.last_stream_token.clone()
    }

    fn set_last_stream_token(&mut self, stream_token: Vec<u8>) {
        self.last_stream_token = stream_token;
    }

    fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        if mutations.is_empty() {
            return Err(invalid_argument("Mutation batches should not be empty"));
        }
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;

        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        for mutation in &batch.mutations {
            self.batches_by_document_key
                .add_reference(mutation.key().clone(), batch_id);
        }
        self.queue.push(batch.clone());
        Ok(batch)
    }

    fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<MutationBatch> {
        self.index_of_batch_id(batch_id)
            .map(|index| self.queue[index].clone())
    }

    fn next_mutation_batch_after(&self, batch_id: BatchId) -> Option<MutationBatch> {
        self.queue
            .iter()
            .find(|batch| batch.batch_id > batch_id)
            .cloned()
    }

    fn get_highest_unacknowledged_batch_id(&self) -> BatchId {
        self.queue
            .last()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    fn all_mutation_batches(&self) -> Vec<MutationBatch> {
        self.queue.clone()
    }

    fn all_mutation_batches_affecting_key(&self, key: &DocumentKey) -> Vec<MutationBatch> {
        self.batches_for_ids(self.batches_by_document_key.ids_for_key(key))
    }

    fn all_mutation_batches_affecting_keys(&self, keys: &BTreeSet<DocumentKey>) -> Vec<MutationBatch> {
        self.batches_for_ids(
            keys.iter()
                .flat_map(|key| self.batches_by_document_key.ids_for_key(key)),
        )
    }

    fn all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<MutationBatch> {
        let ids: Vec<BatchId> = self
            .queue
            .iter()
            .filter(|batch| {
                batch.mutations.iter().any(|mutation| {
                    let path = mutation.key().path();
                    match query.collection_group_id() {
                        Some(group) => {
                            mutation.key().has_collection_id(group) && query.path().is_prefix_of(path)
                        }
                        None if query.is_document_query() => query.path() == path,
                        None => query.path().is_immediate_parent_of(path),
                    }
                })
            })
            .map(|batch| batch.batch_id)
            .collect();
        self.batches_for_ids(ids)
    }

    fn remove_mutation_batch(&mut self, batch: &MutationBatch) -> FirestoreResult<()> {
        match self.queue.first() {
            Some(first) if first.batch_id == batch.batch_id => {}
            _ => {
                return Err(internal_error(format!(
                    "Can only remove the first entry of the mutation queue, got {}",
                    batch.batch_id
                )))
            }
        }
        self.queue.remove(0);
        for mutation in &batch.mutations {
            self.batches_by_document_key
                .remove_reference(mutation.key(), batch.batch_id);
        }
        Ok(())
    }

    fn contains_key(&self, key: &DocumentKey) -> bool {
        self.batches_by_document_key.contains_key(key)
    }

    fn perform_consistency_check(&self) -> FirestoreResult<()> {
        if self.queue.is_empty() && !self.batches_by_document_key.is_empty() {
            return Err(internal_error(
                "Document leak: mutation queue is empty but references remain",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::value::ObjectValue;

    fn set(path: &str) -> Mutation {
        Mutation::set(DocumentKey::from_string(path).unwrap(), ObjectValue::empty())
    }

    #[test]
    fn assigns_increasing_batch_ids() {
        let mut queue = MemoryMutationQueue::new();
        let first = queue
            .add_mutation_batch(Timestamp::now(), Vec::new(), vec![set("c/a")])
            .unwrap();
        let second = queue
            .add_mutation_batch(Timestamp::now(), Vec::new(), vec![set("c/a"), set("c/b")])
            .unwrap();
        assert!(second.batch_id > first.batch_id);
        assert_eq!(queue.get_highest_unacknowledged_batch_id(), second.batch_id);
        assert_eq!(
            queue
                .all_mutation_batches_affecting_key(&DocumentKey::from_string("c/a").unwrap())
                .len(),
            2
        );
        assert_eq!(
            queue.next_mutation_batch_after(first.batch_id).map(|b| b.batch_id),
            Some(second.batch_id)
        );
    }

    #[test]
    fn only_the_head_batch_can_be_removed() {
        let mut queue = MemoryMutationQueue::new();
        let first = queue
            .add_mutation_batch(Timestamp::now(), Vec::new(), vec![set("c/a")])
            .unwrap();
        let second = queue
            .add_mutation_batch(Timestamp::now(), Vec::new(), vec![set("c/b")])
            .unwrap();
        assert!(queue.remove_mutation_batch(&second).is_err());
        queue.remove_mutation_batch(&first).unwrap();
        queue.remove_mutation_batch(&second).unwrap();
        assert!(queue.is_empty());
        queue.perform_consistency_check().unwrap();
    }
}
