use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_lock::Mutex;

use crate::firestore::error::{aborted, failed_precondition, internal_error, invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKey, FieldMask, MutableDocument, Mutation, Precondition, SnapshotVersion};
use crate::firestore::remote::Datastore;
use crate::firestore::value::ObjectValue;

#[derive(Default)]
struct TransactionState {
    /// Version of every document read; `min` for documents that did not
    /// exist.
    read_versions: BTreeMap<DocumentKey, SnapshotVersion>,
    mutations: Vec<Mutation>,
    written_docs: BTreeSet<DocumentKey>,
    committed: bool,
    /// First error raised by a write; it fails the commit.
    last_error: Option<FirestoreError>,
}

/// Reads and buffered writes of one transaction attempt.
///
/// All reads must happen before the first write. Writes to documents read
/// earlier are conditioned on the version that was read, so the commit
/// fails if another client changed them in between. Clones share the same
/// attempt.
#[derive(Clone)]
pub struct Transaction {
    datastore: Arc<dyn Datastore>,
    state: Arc<Mutex<TransactionState>>,
}

impl Transaction {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self {
            datastore,
            state: Arc::new(Mutex::new(TransactionState::default())),
        }
    }

    /// Reads `keys` from the backend. Missing documents come back as
    /// `NoDocument`s.
    pub async fn lookup(&self, keys: &[DocumentKey]) -> FirestoreResult<Vec<MutableDocument>> {
        {
            let mut state = self.state.lock().await;
            ensure_commit_not_called(&state)?;
            if !state.mutations.is_empty() {
                let error = invalid_argument("Firestore transactions require all reads to be executed before all writes.");
                state.last_error = Some(error.clone());
                return Err(error);
            }
        }

        let documents = self.datastore.lookup(keys).await?;
        let mut state = self.state.lock().await;
        for document in &documents {
            record_version(&mut state, document)?;
        }
        Ok(documents)
    }

    /// Overwrites the document.
    pub async fn set(&self, key: DocumentKey, data: ObjectValue) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let precondition = precondition(&state, &key);
        write(&mut state, Mutation::set(key.clone(), data).with_precondition(precondition))?;
        state.written_docs.insert(key);
        Ok(())
    }

    /// Updates the fields in `mask`. Fails the transaction if the document
    /// was read and did not exist.
    pub async fn update(&self, key: DocumentKey, data: ObjectValue, mask: FieldMask) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let result = match precondition_for_update(&state, &key) {
            Ok(precondition) => write(
                &mut state,
                Mutation::patch(key.clone(), data, mask).with_precondition(precondition),
            ),
            Err(error) => Err(error),
        };
        if let Err(error) = &result {
            state.last_error = Some(error.clone());
        }
        state.written_docs.insert(key);
        result
    }

    pub async fn delete(&self, key: DocumentKey) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let precondition = precondition(&state, &key);
        write(&mut state, Mutation::delete(key.clone()).with_precondition(precondition))?;
        state.written_docs.insert(key);
        Ok(())
    }

    /// Sends the buffered writes, plus a verify for every document that was
    /// read but not written.
    pub async fn commit(&self) -> FirestoreResult<()> {
        let mutations = {
            let mut state = self.state.lock().await;
            ensure_commit_not_called(&state)?;
            if let Some(error) = state.last_error.clone() {
                return Err(error);
            }

            let mut unwritten = state.read_versions.clone();
            for mutation in &state.mutations {
                unwritten.remove(mutation.key());
            }
            let mut mutations = std::mem::take(&mut state.mutations);
            for key in unwritten.into_keys() {
                let precondition = precondition(&state, &key);
                mutations.push(Mutation::verify(key, precondition));
            }
            state.committed = true;
            mutations
        };
        self.datastore.commit(mutations).await
    }
}

fn ensure_commit_not_called(state: &TransactionState) -> FirestoreResult<()> {
    if state.committed {
        return Err(failed_precondition("A transaction object cannot be used after its update callback has been invoked."));
    }
    Ok(())
}

fn write(state: &mut TransactionState, mutation: Mutation) -> FirestoreResult<()> {
    ensure_commit_not_called(state)?;
    state.mutations.push(mutation);
    Ok(())
}

fn record_version(state: &mut TransactionState, document: &MutableDocument) -> FirestoreResult<()> {
    let version = if document.is_found_document() {
        document.version()
    } else if document.is_no_document() {
        SnapshotVersion::min()
    } else {
        return Err(internal_error(format!(
            "Document in a transaction was a {:?}",
            document.document_type()
        )));
    };

    match state.read_versions.get(document.key()) {
        Some(existing) if *existing != version => Err(aborted("Document version changed between two reads.")),
        Some(_) => Ok(()),
        None => {
            state.read_versions.insert(document.key().clone(), version);
            Ok(())
        }
    }
}

/// Precondition for a write to `key`: the read version, or none for blind
/// writes and documents already written in this transaction.
fn precondition(state: &TransactionState, key: &DocumentKey) -> Precondition {
    match state.read_versions.get(key) {
        Some(version) if !state.written_docs.contains(key) => {
            if version.is_min() {
                Precondition::Exists(false)
            } else {
                Precondition::UpdateTime(*version)
            }
        }
        _ => Precondition::None,
    }
}

fn precondition_for_update(state: &TransactionState, key: &DocumentKey) -> FirestoreResult<Precondition> {
    match state.read_versions.get(key) {
        Some(version) if !state.written_docs.contains(key) => {
            // The backend cannot express "update only if missing", so a
            // read that found nothing fails here.
            if version.is_min() {
                Err(invalid_argument("Can't update a document that doesn't exist."))
            } else {
                Ok(Precondition::UpdateTime(*version))
            }
        }
        _ => Ok(Precondition::Exists(true)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::FieldPath;
    use crate::firestore::remote::InMemoryDatastore;
    use crate::firestore::value::FirestoreValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(value: i64) -> ObjectValue {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_dot_separated("count").unwrap(), FirestoreValue::from_integer(value));
        data
    }

    #[tokio::test]
    async fn writes_after_reads_carry_the_read_version() {
        let datastore = InMemoryDatastore::new();
        datastore.seed(key("c/a"), data(1));
        let transaction = Transaction::new(Arc::new(datastore.clone()));

        transaction.lookup(&[key("c/a")]).await.unwrap();
        // Someone else writes between the read and the commit.
        datastore.seed(key("c/a"), data(5));
        transaction.set(key("c/a"), data(2)).await.unwrap();

        let error = transaction.commit().await.unwrap_err();
        assert_eq!(error.code, FirestoreErrorCode::FailedPrecondition);
        assert_eq!(datastore.get(&key("c/a")).unwrap().data(), &data(5));
    }

    #[tokio::test]
    async fn reading_after_writing_is_rejected() {
        let transaction = Transaction::new(Arc::new(InMemoryDatastore::new()));
        transaction.set(key("c/a"), data(1)).await.unwrap();

        let error = transaction.lookup(&[key("c/a")]).await.unwrap_err();
        assert_eq!(error.code, FirestoreErrorCode::InvalidArgument);
        assert_eq!(transaction.commit().await.unwrap_err().code, FirestoreErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn read_only_documents_are_verified() {
        let datastore = InMemoryDatastore::new();
        datastore.seed(key("c/a"), data(1));
        let transaction = Transaction::new(Arc::new(datastore.clone()));
        transaction.lookup(&[key("c/a"), key("c/missing")]).await.unwrap();
        transaction.set(key("c/b"), data(3)).await.unwrap();

        datastore.seed(key("c/missing"), data(9));
        let error = transaction.commit().await.unwrap_err();
        assert_eq!(error.code, FirestoreErrorCode::FailedPrecondition);
        assert!(datastore.get(&key("c/b")).is_none());
    }

    #[tokio::test]
    async fn updating_a_missing_document_fails_locally() {
        let transaction = Transaction::new(Arc::new(InMemoryDatastore::new()));
        transaction.lookup(&[key("c/a")]).await.unwrap();
        let mask = FieldMask::new([FieldPath::from_dot_separated("count").unwrap()]);
        let error = transaction.update(key("c/a"), data(1), mask).await.unwrap_err();
        assert_eq!(error.code, FirestoreErrorCode::InvalidArgument);
    }
}
