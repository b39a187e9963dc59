use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::firestore::error::{failed_precondition, FirestoreError, FirestoreResult};
use crate::firestore::model::{
    DocumentKey, FieldTransform, MutableDocument, Mutation, MutationResult, SnapshotVersion, Timestamp,
    TransformOperation,
};
use crate::firestore::value::{FirestoreValue, ObjectValue};

use super::Datastore;

/// Backend stand-in holding documents in memory. Every commit advances a
/// logical clock by one microsecond, which becomes the commit version.
#[derive(Clone, Default)]
pub struct InMemoryDatastore {
    state: Arc<Mutex<DatastoreState>>,
}

#[derive(Default)]
struct DatastoreState {
    documents: BTreeMap<DocumentKey, MutableDocument>,
    clock: i64,
    injected_failures: VecDeque<FirestoreError>,
    commit_count: usize,
}

impl DatastoreState {
    fn tick(&mut self) -> SnapshotVersion {
        self.clock += 1;
        SnapshotVersion::from_micros(self.clock)
    }

    fn current(&self, key: &DocumentKey) -> MutableDocument {
        self.documents
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()))
    }
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, DatastoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Writes `data` directly, bypassing preconditions.
    pub fn seed(&self, key: DocumentKey, data: ObjectValue) -> SnapshotVersion {
        let mut state = self.state();
        let version = state.tick();
        state
            .documents
            .insert(key.clone(), MutableDocument::new_found_document(key, version, data));
        version
    }

    /// The next commit fails with `error` before touching any document.
    pub fn fail_next_commit(&self, error: FirestoreError) {
        self.state().injected_failures.push_back(error);
    }

    /// Number of commits that reached the store, successful or not.
    pub fn commit_count(&self) -> usize {
        self.state().commit_count
    }

    pub fn get(&self, key: &DocumentKey) -> Option<MutableDocument> {
        self.state()
            .documents
            .get(key)
            .filter(|document| document.is_found_document())
            .cloned()
    }
}

fn transform_results(
    transforms: &[FieldTransform],
    document: &MutableDocument,
    commit_time: Timestamp,
) -> Vec<FirestoreValue> {
    transforms
        .iter()
        .map(|transform| match &transform.operation {
            TransformOperation::ServerTimestamp => FirestoreValue::from_timestamp(commit_time),
            operation => operation.apply_to_local_view(document.field(&transform.field_path), commit_time),
        })
        .collect()
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl Datastore for InMemoryDatastore {
    async fn lookup(&self, keys: &[DocumentKey]) -> FirestoreResult<Vec<MutableDocument>> {
        let state = self.state();
        let read_time = SnapshotVersion::from_micros(state.clock);
        Ok(keys
            .iter()
            .map(|key| match state.documents.get(key) {
                Some(document) if document.is_found_document() => document.clone().set_read_time(read_time),
                _ => MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()).set_read_time(read_time),
            })
            .collect())
    }

    async fn commit(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let mut state = self.state();
        state.commit_count += 1;
        if let Some(error) = state.injected_failures.pop_front() {
            return Err(error);
        }

        let mut staged: BTreeMap<DocumentKey, MutableDocument> = BTreeMap::new();
        for mutation in &mutations {
            let document = staged
                .get(mutation.key())
                .cloned()
                .unwrap_or_else(|| state.current(mutation.key()));
            if !mutation.precondition().is_valid_for(&document) {
                return Err(failed_precondition(format!(
                    "Precondition failed for document {}",
                    mutation.key().path().canonical_string()
                )));
            }
            staged.insert(mutation.key().clone(), document);
        }

        let commit_version = state.tick();
        for mutation in &mutations {
            if matches!(mutation, Mutation::Verify { .. }) {
                continue;
            }
            let document = staged
                .remove(mutation.key())
                .unwrap_or_else(|| state.current(mutation.key()));
            let results = transform_results(mutation.field_transforms(), &document, commit_version.timestamp());
            let applied = mutation.apply_to_remote_document(document, &MutationResult::new(commit_version, results));
            let stored = if applied.is_found_document() {
                MutableDocument::new_found_document(mutation.key().clone(), commit_version, applied.data().clone())
            } else {
                MutableDocument::new_no_document(mutation.key().clone(), commit_version)
            };
            staged.insert(mutation.key().clone(), stored);
        }

        for (key, document) in staged {
            if document.version() == commit_version {
                state.documents.insert(key, document);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{aborted, FirestoreErrorCode};
    use crate::firestore::model::{FieldMask, FieldPath, Precondition};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn object(field: &str, value: FirestoreValue) -> ObjectValue {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_dot_separated(field).unwrap(), value);
        data
    }

    #[tokio::test]
    async fn lookup_reports_missing_documents() {
        let datastore = InMemoryDatastore::new();
        let version = datastore.seed(key("rooms/a"), object("n", FirestoreValue::from_integer(1)));

        let docs = datastore.lookup(&[key("rooms/a"), key("rooms/b")]).await.unwrap();
        assert!(docs[0].is_found_document());
        assert_eq!(docs[0].version(), version);
        assert!(docs[1].is_no_document());
        assert_eq!(docs[1].version(), SnapshotVersion::min());
    }

    #[tokio::test]
    async fn commit_checks_preconditions_atomically() {
        let datastore = InMemoryDatastore::new();
        let version = datastore.seed(key("rooms/a"), object("n", FirestoreValue::from_integer(1)));

        let result = datastore
            .commit(vec![
                Mutation::set(key("rooms/b"), object("n", FirestoreValue::from_integer(2))),
                Mutation::delete(key("rooms/a")).with_precondition(Precondition::UpdateTime(SnapshotVersion::min())),
            ])
            .await;
        assert_eq!(result.unwrap_err().code, FirestoreErrorCode::FailedPrecondition);
        assert!(datastore.get(&key("rooms/b")).is_none());

        datastore
            .commit(vec![
                Mutation::verify(key("rooms/a"), Precondition::UpdateTime(version)),
                Mutation::set(key("rooms/b"), object("n", FirestoreValue::from_integer(2))),
            ])
            .await
            .unwrap();
        assert!(datastore.get(&key("rooms/b")).is_some());
    }

    #[tokio::test]
    async fn commit_applies_transforms_and_patches() {
        let datastore = InMemoryDatastore::new();
        datastore.seed(key("rooms/a"), object("n", FirestoreValue::from_integer(1)));

        let patch = Mutation::patch(
            key("rooms/a"),
            object("title", FirestoreValue::from_string("hi")),
            FieldMask::new([FieldPath::from_dot_separated("title").unwrap()]),
        )
        .with_precondition(Precondition::Exists(true))
        .with_transforms(vec![FieldTransform::new(
            FieldPath::from_dot_separated("n").unwrap(),
            TransformOperation::NumericIncrement(FirestoreValue::from_integer(4)),
        )]);
        datastore.commit(vec![patch]).await.unwrap();

        let stored = datastore.get(&key("rooms/a")).unwrap();
        assert_eq!(
            stored.field(&FieldPath::from_dot_separated("n").unwrap()),
            Some(&FirestoreValue::from_integer(5))
        );
        assert_eq!(
            stored.field(&FieldPath::from_dot_separated("title").unwrap()),
            Some(&FirestoreValue::from_string("hi"))
        );
    }

    #[tokio::test]
    async fn injected_failures_fail_one_commit() {
        let datastore = InMemoryDatastore::new();
        datastore.fail_next_commit(aborted("contention"));

        let mutation = Mutation::set(key("rooms/a"), ObjectValue::empty());
        assert!(datastore.commit(vec![mutation.clone()]).await.is_err());
        assert!(datastore.commit(vec![mutation]).await.is_ok());
        assert_eq!(datastore.commit_count(), 2);
    }
}
