use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::Query;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::{IndexOffset, QueryContext, RemoteDocumentCache};
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};

#[derive(Clone, Debug, Default)]
pub struct MemoryRemoteDocumentCache {
    documents: BTreeMap<DocumentKey, MutableDocument>,
}

impl MemoryRemoteDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RemoteDocumentCache for MemoryRemoteDocumentCache {
    fn add_entry(&mut self, document: MutableDocument, read_time: SnapshotVersion) -> FirestoreResult<()> {
        if read_time.is_min() {
            return Err(invalid_argument(format!(
                "Cannot add document {} with a read time of zero",
                document.key()
            )));
        }
        let document = document.set_read_time(read_time);
        self.documents.insert(document.key().clone(), document);
        Ok(())
    }

    fn remove_entry(&mut self, key: &DocumentKey) {
        self.documents.remove(key);
    }

    fn get_entry(&self, key: &DocumentKey) -> MutableDocument {
        self.documents
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone()))
    }

    fn get_entries(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, MutableDocument> {
        keys.iter()
            .map(|key| (key.clone(), self.get_entry(key)))
            .collect()
    }

    fn get_documents_matching_query(
        &self,
        query: &Query,
        offset: &IndexOffset,
        mutated_keys: &BTreeSet<DocumentKey>,
        context: &mut QueryContext,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let collection = query.path();
        let mut results = BTreeMap::new();
        for (key, document) in &self.documents {
            if !collection.is_prefix_of(key.path()) {
                continue;
            }
            context.documents_read_count += 1;
            if !collection.is_immediate_parent_of(key.path()) {
                continue;
            }
            if !offset.precedes(document) {
                continue;
            }
            if !mutated_keys.contains(key) && !query.matches(document) {
                continue;
            }
            results.insert(key.clone(), document.clone());
        }
        results
    }

    fn get_all_from_collection_group(
        &self,
        collection_group: &str,
        offset: &IndexOffset,
        limit: usize,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let mut candidates: Vec<&MutableDocument> = self
            .documents
            .values()
            .filter(|document| document.key().has_collection_id(collection_group))
            .filter(|document| offset.precedes(document))
            .collect();
        candidates.sort_by(|left, right| {
            left.read_time()
                .cmp(&right.read_time())
                .then_with(|| left.key().cmp(right.key()))
        });
        candidates
            .into_iter()
            .take(limit)
            .map(|document| (document.key().clone(), document.clone()))
            .collect()
    }

    fn document_keys(&self) -> BTreeSet<DocumentKey> {
        self.documents.keys().cloned().collect()
    }

    fn size(&self) -> usize {
        self.documents.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{ResourcePath, Timestamp};
    use crate::firestore::value::ObjectValue;

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str, seconds: i64) -> MutableDocument {
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            version(seconds),
            ObjectValue::empty(),
        )
    }

    #[test]
    fn unknown_keys_read_as_invalid_documents() {
        let cache = MemoryRemoteDocumentCache::new();
        let entry = cache.get_entry(&DocumentKey::from_string("c/missing").unwrap());
        assert!(!entry.is_valid_document());
    }

    #[test]
    fn query_scan_counts_reads_and_skips_subcollections() {
        let mut cache = MemoryRemoteDocumentCache::new();
        cache.add_entry(doc("c/a", 1), version(1)).unwrap();
        cache.add_entry(doc("c/b", 2), version(2)).unwrap();
        cache.add_entry(doc("c/a/sub/x", 3), version(3)).unwrap();
        cache.add_entry(doc("other/z", 3), version(3)).unwrap();

        let query = Query::collection(ResourcePath::from_string("c").unwrap());
        let mut context = QueryContext::default();
        let results = cache.get_documents_matching_query(
            &query,
            &IndexOffset::from_read_time(version(1)),
            &BTreeSet::new(),
            &mut context,
        );
        assert_eq!(results.len(), 1);
        assert!(results.contains_key(&DocumentKey::from_string("c/b").unwrap()));
        assert_eq!(context.documents_read_count, 3);
    }
}
