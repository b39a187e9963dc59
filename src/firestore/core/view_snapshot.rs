use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::firestore::core::Query;
use crate::firestore::model::{DocumentKey, DocumentSet, MutableDocument};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only `has_pending_writes` or `from_cache` changed.
    Metadata,
}

impl ChangeType {
    /// Emission rank: removals first, then additions, then modifications.
    pub(crate) fn rank(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub doc: MutableDocument,
}

/// Collects the changes of one snapshot, folding repeated changes of the
/// same key into one.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.doc.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(DocumentViewChange {
                change_type: new_type,
                doc: change.doc,
            }),
            (old_type, Metadata) if old_type != Removed => Some(DocumentViewChange {
                change_type: old_type,
                doc: change.doc,
            }),
            (Modified, Modified) => Some(DocumentViewChange {
                change_type: Modified,
                doc: change.doc,
            }),
            (Added, Modified) => Some(DocumentViewChange {
                change_type: Added,
                doc: change.doc,
            }),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange {
                change_type: Removed,
                doc: old.doc.clone(),
            }),
            (Removed, Added) => Some(DocumentViewChange {
                change_type: Modified,
                doc: change.doc,
            }),
            (old_type, new_type) => {
                log::error!("view: unsupported change {new_type:?} after {old_type:?} for {key}");
                Some(change)
            }
        };

        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&DocumentViewChange> {
        self.changes.get(key)
    }
}

/// Whether a view is in sync with the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// Results come from the cache and may lag behind the backend.
    Local,
    Synced,
}

/// One emission of a query listener.
#[derive(Clone)]
pub struct ViewSnapshot {
    pub query: Query,
    pub docs: DocumentSet,
    pub old_docs: DocumentSet,
    pub doc_changes: Vec<DocumentViewChange>,
    /// Keys of the documents with local writes not yet acknowledged.
    pub mutated_keys: BTreeSet<DocumentKey>,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// Snapshot listing every document of `documents` as added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let doc_changes = documents
            .iter()
            .map(|doc| DocumentViewChange {
                change_type: ChangeType::Added,
                doc: doc.clone(),
            })
            .collect();
        let old_docs = DocumentSet::new(documents.comparator());
        Self {
            query,
            docs: documents,
            old_docs,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}

impl PartialEq for ViewSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.from_cache == other.from_cache
            && self.has_cached_results == other.has_cached_results
            && self.sync_state_changed == other.sync_state_changed
            && self.mutated_keys == other.mutated_keys
            && self.query == other.query
            && self.docs == other.docs
            && self.old_docs == other.old_docs
            && self.doc_changes == other.doc_changes
    }
}

impl fmt::Debug for ViewSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewSnapshot")
            .field("query", &self.query.canonical_id())
            .field("docs", &self.docs)
            .field("doc_changes", &self.doc_changes.len())
            .field("from_cache", &self.from_cache)
            .field("has_pending_writes", &self.has_pending_writes())
            .finish()
    }
}
