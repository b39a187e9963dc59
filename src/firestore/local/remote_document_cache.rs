use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::IndexOffset;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};

/// Read instrumentation for a single query execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryContext {
    pub documents_read_count: usize,
}

/// Cache of the latest documents received from the backend.
pub trait RemoteDocumentCache: Send {
    /// Stores `document` with its read time. Versions for a key only move
    /// forward; callers decide whether an update is newer.
    fn add_entry(&mut self, document: MutableDocument, read_time: SnapshotVersion) -> FirestoreResult<()>;

    fn remove_entry(&mut self, key: &DocumentKey);

    /// The cached document, or an invalid document when the key is unknown.
    fn get_entry(&self, key: &DocumentKey) -> MutableDocument;

    fn get_entries(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, MutableDocument>;

    /// Documents in the query's collection that changed after `offset` and
    /// either match the query or are in `mutated_keys`.
    fn get_documents_matching_query(
        &self,
        query: &Query,
        offset: &IndexOffset,
        mutated_keys: &BTreeSet<DocumentKey>,
        context: &mut QueryContext,
    ) -> BTreeMap<DocumentKey, MutableDocument>;

    /// Up to `limit` documents of a collection group changed after `offset`,
    /// in offset order.
    fn get_all_from_collection_group(
        &self,
        collection_group: &str,
        offset: &IndexOffset,
        limit: usize,
    ) -> BTreeMap<DocumentKey, MutableDocument>;

    fn document_keys(&self) -> BTreeSet<DocumentKey>;

    fn size(&self) -> usize;
}
