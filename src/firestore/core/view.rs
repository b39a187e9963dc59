use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot,
};
use crate::firestore::core::{LimitType, Query};
use crate::firestore::local::QueryResult;
use crate::firestore::model::{DocumentComparator, DocumentKey, DocumentSet, MutableDocument};
use crate::firestore::remote::{OnlineState, TargetChange};

/// A key entering or leaving the limbo set of a view.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

impl LimboDocumentChange {
    pub fn key(&self) -> &DocumentKey {
        match self {
            LimboDocumentChange::Added(key) | LimboDocumentChange::Removed(key) => key,
        }
    }
}

/// Intermediate result of [`View::compute_doc_changes`], applied with
/// [`View::apply_changes`].
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// A limited query lost a document that some document outside the
    /// current window may replace; the caller has to re-run the query.
    pub needs_refill: bool,
    pub mutated_keys: BTreeSet<DocumentKey>,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Incrementally maintained result of one query.
///
/// The view does not know the sync engine; it returns [`ViewChange`]s and
/// the sync engine decides what to raise and which limbo targets to open.
pub struct View {
    query: Query,
    comparator: DocumentComparator,
    sync_state: Option<SyncState>,
    has_cached_results: bool,
    /// Whether the target is in sync with the backend, as of the last target
    /// change.
    current: bool,
    document_set: DocumentSet,
    /// Keys the backend reported for the target.
    synced_documents: BTreeSet<DocumentKey>,
    limbo_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        let comparator = query.comparator();
        Self {
            document_set: DocumentSet::new(comparator.clone()),
            comparator,
            query,
            sync_state: None,
            has_cached_results: false,
            current: false,
            synced_documents,
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn is_current(&self) -> bool {
        self.current
    }

    pub fn document_set(&self) -> &DocumentSet {
        &self.document_set
    }

    /// Snapshot of the current state with every document as an addition,
    /// for a listener attaching to an existing view.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state != Some(SyncState::Synced),
            self.has_cached_results,
        )
    }

    /// Diffs `docs` against the view (or against `previous`, when refilling)
    /// without changing the view.
    pub fn compute_doc_changes(
        &self,
        docs: &BTreeMap<DocumentKey, MutableDocument>,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut change_set, old_document_set, mut mutated_keys) = match previous {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut document_set = old_document_set.clone();
        let mut needs_refill = false;

        let limit = self.query.limit().map(|limit| limit as usize);
        let at_limit = limit == Some(old_document_set.len());
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => old_document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => old_document_set.first().cloned(),
            _ => None,
        };

        for (key, entry) in docs {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);

            let old_had_pending = old_doc.is_some() && self.mutated_keys.contains(key);
            let new_has_pending = new_doc.is_some_and(|doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.contains(key) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange {
                                change_type: ChangeType::Modified,
                                doc: new_doc.clone(),
                            });
                            change_applied = true;

                            let left_window = last_doc_in_limit
                                .as_ref()
                                .is_some_and(|last| (self.comparator)(new_doc, last) == Ordering::Greater)
                                || first_doc_in_limit
                                    .as_ref()
                                    .is_some_and(|first| (self.comparator)(new_doc, first) == Ordering::Less);
                            if left_window {
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.track(DocumentViewChange {
                            change_type: ChangeType::Metadata,
                            doc: new_doc.clone(),
                        });
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Added,
                        doc: new_doc.clone(),
                    });
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Removed,
                        doc: old_doc.clone(),
                    });
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        document_set.add(new_doc.clone());
                        if new_has_pending {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.delete(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => document_set.last().cloned(),
                    LimitType::Last => document_set.first().cloned(),
                };
                let Some(evicted) = evicted else {
                    break;
                };
                document_set.delete(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange {
                    change_type: ChangeType::Removed,
                    doc: evicted,
                });
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            needs_refill,
            mutated_keys,
        }
    }

    /// Commits `doc_changes` to the view and produces the snapshot to raise,
    /// if anything changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        update_limbo_documents: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let old_docs = std::mem::replace(&mut self.document_set, doc_changes.document_set.clone());
        self.mutated_keys = doc_changes.mutated_keys.clone();

        let mut changes = doc_changes.change_set.changes();
        let comparator = &self.comparator;
        changes.sort_by(|left, right| {
            left.change_type
                .rank()
                .cmp(&right.change_type.rank())
                .then_with(|| comparator(&left.doc, &right.doc))
        });

        self.apply_target_change(target_change);

        let limbo_changes = if update_limbo_documents && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced { SyncState::Synced } else { SyncState::Local };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if let Some(change) = target_change {
            self.has_cached_results = !change.resume_token.is_empty();
        }

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        let snapshot = ViewSnapshot {
            query: self.query.clone(),
            docs: doc_changes.document_set,
            old_docs,
            doc_changes: changes,
            mutated_keys: doc_changes.mutated_keys,
            from_cache: new_sync_state == SyncState::Local,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: self.has_cached_results,
        };
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// Going offline makes a current view serve from cache again.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            self.apply_changes(unchanged, false, None, false)
        } else {
            ViewChange::default()
        }
    }

    /// Replaces the synced keys with the persisted ones and rebuilds the view
    /// from `query_result`, recomputing limbo documents from scratch.
    pub fn synchronize_with_persisted_remote_keys(&mut self, query_result: &QueryResult) -> ViewChange {
        self.synced_documents = query_result.remote_keys.clone();
        self.limbo_documents.clear();
        let docs: BTreeMap<DocumentKey, MutableDocument> = query_result
            .documents
            .iter()
            .map(|doc| (doc.key().clone(), doc.clone()))
            .collect();
        let doc_changes = self.compute_doc_changes(&docs, None);
        self.apply_changes(doc_changes, true, None, false)
    }

    /// Keys that should be in limbo: shown by the view, not reported by the
    /// backend, and not explained by a local write.
    pub fn compute_initial_limbo_documents(&self) -> BTreeSet<DocumentKey> {
        self.document_set
            .iter()
            .filter(|doc| self.should_be_in_limbo(doc))
            .map(|doc| doc.key().clone())
            .collect()
    }

    fn should_be_in_limbo(&self, doc: &MutableDocument) -> bool {
        !self.synced_documents.contains(doc.key()) && !doc.has_local_mutations()
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        for key in &change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &change.modified_documents {
            if !self.synced_documents.contains(key) {
                log::debug!("view: modified document {key} was not synced");
            }
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        // Only a current target tells which documents are really missing.
        if !self.current {
            return Vec::new();
        }
        let new_limbo = self.compute_initial_limbo_documents();
        let old_limbo = std::mem::replace(&mut self.limbo_documents, new_limbo);

        let mut changes: Vec<LimboDocumentChange> = old_limbo
            .difference(&self.limbo_documents)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            self.limbo_documents
                .difference(&old_limbo)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        changes
    }
}

/// A local write that was just acknowledged keeps its local state until the
/// backend sends the committed document, avoiding a flicker back to the old
/// data.
fn should_wait_for_synced_document(old_doc: &MutableDocument, new_doc: &MutableDocument) -> bool {
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Direction, OrderBy};
    use crate::firestore::model::{FieldPath, ResourcePath, SnapshotVersion};
    use crate::firestore::value::{FirestoreValue, ObjectValue};

    fn doc(path: &str, order: i64) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_dot_separated("order").unwrap(), FirestoreValue::from_integer(order));
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            data,
        )
    }

    fn docs(documents: &[MutableDocument]) -> BTreeMap<DocumentKey, MutableDocument> {
        documents.iter().map(|doc| (doc.key().clone(), doc.clone())).collect()
    }

    fn ordered_query() -> Query {
        Query::collection(ResourcePath::from_string("rooms").unwrap()).with_order_by(OrderBy::new(
            FieldPath::from_dot_separated("order").unwrap(),
            Direction::Ascending,
        ))
    }

    fn apply(view: &mut View, documents: &[MutableDocument]) -> ViewSnapshot {
        let changes = view.compute_doc_changes(&docs(documents), None);
        view.apply_changes(changes, true, None, false)
            .snapshot
            .expect("snapshot")
    }

    fn keys(snapshot: &ViewSnapshot) -> Vec<String> {
        snapshot.docs.iter().map(|doc| doc.key().to_string()).collect()
    }

    fn changes(snapshot: &ViewSnapshot) -> Vec<(ChangeType, String)> {
        snapshot
            .doc_changes
            .iter()
            .map(|change| (change.change_type, change.doc.key().to_string()))
            .collect()
    }

    #[test]
    fn every_key_gets_exactly_one_change() {
        let mut view = View::new(ordered_query(), BTreeSet::new());
        apply(&mut view, &[doc("rooms/a", 1), doc("rooms/b", 2), doc("rooms/c", 3)]);

        let mut removed_b = doc("rooms/b", 0);
        removed_b = removed_b.convert_to_no_document(SnapshotVersion::from_micros(2));
        let snapshot = apply(&mut view, &[doc("rooms/a", 5), removed_b, doc("rooms/d", 4)]);

        assert_eq!(keys(&snapshot), vec!["rooms/c", "rooms/d", "rooms/a"]);
        assert_eq!(
            changes(&snapshot),
            vec![
                (ChangeType::Removed, "rooms/b".to_string()),
                (ChangeType::Added, "rooms/d".to_string()),
                (ChangeType::Modified, "rooms/a".to_string()),
            ]
        );
    }

    #[test]
    fn limit_evicts_past_the_edge_and_requests_refill() {
        let query = ordered_query().limit_to_first(2);
        let mut view = View::new(query, BTreeSet::new());
        let snapshot = apply(&mut view, &[doc("rooms/a", 1), doc("rooms/b", 2), doc("rooms/c", 3)]);
        assert_eq!(keys(&snapshot), vec!["rooms/a", "rooms/b"]);

        let removed = doc("rooms/a", 1).convert_to_no_document(SnapshotVersion::from_micros(2));
        let changes = view.compute_doc_changes(&docs(&[removed]), None);
        assert!(changes.needs_refill);
        assert_eq!(changes.document_set.len(), 1);

        let refilled = view.compute_doc_changes(&docs(&[doc("rooms/b", 2), doc("rooms/c", 3)]), Some(changes));
        assert_eq!(refilled.document_set.len(), 2);
        let snapshot = view.apply_changes(refilled, true, None, false).snapshot.unwrap();
        assert_eq!(keys(&snapshot), vec!["rooms/b", "rooms/c"]);
    }

    #[test]
    fn pending_write_flip_is_a_metadata_change() {
        let mut view = View::new(ordered_query(), BTreeSet::new());
        let local = doc("rooms/a", 1).set_has_local_mutations();
        let snapshot = apply(&mut view, &[local]);
        assert!(snapshot.has_pending_writes());

        let changes = view.compute_doc_changes(&docs(&[doc("rooms/a", 1)]), None);
        let snapshot = view.apply_changes(changes, true, None, false).snapshot.unwrap();
        assert_eq!(changes_of(&snapshot), vec![ChangeType::Metadata]);
        assert!(!snapshot.has_pending_writes());
    }

    fn changes_of(snapshot: &ViewSnapshot) -> Vec<ChangeType> {
        snapshot.doc_changes.iter().map(|change| change.change_type).collect()
    }

    #[test]
    fn current_target_puts_unsynced_documents_in_limbo() {
        let mut view = View::new(ordered_query(), BTreeSet::new());
        let a = doc("rooms/a", 1);
        let b = doc("rooms/b", 2);
        let changes = view.compute_doc_changes(&docs(&[a.clone(), b]), None);

        let mut target_change = TargetChange {
            current: true,
            ..TargetChange::default()
        };
        target_change.added_documents.insert(a.key().clone());
        let change = view.apply_changes(changes, true, Some(&target_change), false);

        assert_eq!(
            change.limbo_changes,
            vec![LimboDocumentChange::Added(DocumentKey::from_string("rooms/b").unwrap())]
        );
        assert!(change.snapshot.unwrap().from_cache);
    }

    #[test]
    fn going_offline_marks_current_view_from_cache() {
        let mut view = View::new(ordered_query(), BTreeSet::new());
        let a = doc("rooms/a", 1);
        let changes = view.compute_doc_changes(&docs(&[a.clone()]), None);
        let mut target_change = TargetChange {
            current: true,
            ..TargetChange::default()
        };
        target_change.added_documents.insert(a.key().clone());
        let snapshot = view.apply_changes(changes, true, Some(&target_change), false).snapshot.unwrap();
        assert!(!snapshot.from_cache);

        let snapshot = view.apply_online_state_change(OnlineState::Offline).snapshot.unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.doc_changes.is_empty());
        assert!(view.apply_online_state_change(OnlineState::Offline).snapshot.is_none());
    }
}
