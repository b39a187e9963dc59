use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::Query;
use crate::firestore::local::{IndexOffset, PersistenceTransaction, QueryContext};
use crate::firestore::model::{
    calculate_overlay_mutation, BatchId, DocumentKey, FieldMask, MutableDocument, Mutation,
    Overlay, Timestamp,
};

/// A local document view together with the fields its overlay touched
/// (`None` when the overlay replaced the whole document).
#[derive(Clone, Debug)]
pub(crate) struct OverlayedDocument {
    pub document: MutableDocument,
    pub mutated_fields: Option<FieldMask>,
}

/// Combines the remote document cache with saved overlays to produce the
/// documents the user currently sees. Operates inside one persistence
/// transaction.
pub struct LocalDocumentsView<'t, 'a> {
    txn: &'t mut PersistenceTransaction<'a>,
}

impl<'t, 'a> LocalDocumentsView<'t, 'a> {
    pub fn new(txn: &'t mut PersistenceTransaction<'a>) -> Self {
        Self { txn }
    }

    /// Local view of one document; unknown keys come back as invalid
    /// documents.
    pub fn get_document(&mut self, key: &DocumentKey) -> MutableDocument {
        let document = self.txn.remote_documents.get_entry(key);
        match self.txn.overlays.get_overlay(key) {
            Some(overlay) => {
                overlay
                    .mutation
                    .apply_to_local_view(document, Some(FieldMask::empty()), Timestamp::now())
                    .0
            }
            None => document,
        }
    }

    pub fn get_documents(&mut self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, MutableDocument> {
        let documents = self.txn.remote_documents.get_entries(keys);
        self.get_local_view_of_documents(documents, &BTreeSet::new())
    }

    /// Applies overlays to `documents`. Keys in `existence_changed` whose
    /// overlay depends on the base document get their overlay recomputed.
    pub fn get_local_view_of_documents(
        &mut self,
        documents: BTreeMap<DocumentKey, MutableDocument>,
        existence_changed: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        self.get_overlayed_documents(documents, existence_changed)
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.document))
            .collect()
    }

    pub(crate) fn get_overlayed_documents(
        &mut self,
        documents: BTreeMap<DocumentKey, MutableDocument>,
        existence_changed: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, OverlayedDocument> {
        let keys: BTreeSet<DocumentKey> = documents.keys().cloned().collect();
        let overlays = self.txn.overlays.get_overlays(&keys);

        let mut results = BTreeMap::new();
        let mut recalculate = BTreeMap::new();
        for (key, document) in documents {
            let overlay = overlays.get(&key);
            let depends_on_base = overlay.map_or(true, |overlay| matches!(overlay.mutation, Mutation::Patch { .. }));
            if existence_changed.contains(&key) && depends_on_base {
                recalculate.insert(key, document);
            } else if let Some(overlay) = overlay {
                let mask = overlay.mutation.field_mask();
                let (document, _) =
                    overlay
                        .mutation
                        .apply_to_local_view(document, mask.clone(), Timestamp::now());
                results.insert(
                    key,
                    OverlayedDocument {
                        document,
                        mutated_fields: mask,
                    },
                );
            } else {
                results.insert(
                    key,
                    OverlayedDocument {
                        document,
                        mutated_fields: Some(FieldMask::empty()),
                    },
                );
            }
        }

        for (key, (document, mask)) in self.recalculate_and_save_overlays(recalculate) {
            results.insert(
                key,
                OverlayedDocument {
                    document,
                    mutated_fields: mask,
                },
            );
        }
        results
    }

    /// Recomputes the overlays of `keys` from the mutation queue.
    pub fn recalculate_and_save_overlays_for_document_keys(&mut self, keys: &BTreeSet<DocumentKey>) {
        if keys.is_empty() {
            return;
        }
        let documents = self.txn.remote_documents.get_entries(keys);
        self.recalculate_and_save_overlays(documents);
    }

    /// Folds every queued batch touching the documents on top of their
    /// remote state and saves one overlay per key under the largest batch id
    /// that touched it. Returns the folded documents and their masks.
    fn recalculate_and_save_overlays(
        &mut self,
        mut documents: BTreeMap<DocumentKey, MutableDocument>,
    ) -> BTreeMap<DocumentKey, (MutableDocument, Option<FieldMask>)> {
        if documents.is_empty() {
            return BTreeMap::new();
        }
        let keys: BTreeSet<DocumentKey> = documents.keys().cloned().collect();
        let batches = self.txn.mutation_queue.all_mutation_batches_affecting_keys(&keys);

        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut keys_by_batch: BTreeMap<BatchId, BTreeSet<DocumentKey>> = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                let Some(document) = documents.remove(&key) else {
                    continue;
                };
                let mask = masks.remove(&key).unwrap_or_else(|| Some(FieldMask::empty()));
                let (document, mask) = batch.apply_to_local_view(document, mask);
                documents.insert(key.clone(), document);
                masks.insert(key.clone(), mask);
                keys_by_batch.entry(batch.batch_id).or_default().insert(key);
            }
        }

        let mut processed = BTreeSet::new();
        for (batch_id, keys) in keys_by_batch.iter().rev() {
            let mut overlays = BTreeMap::new();
            for key in keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let Some(document) = documents.get(key) else {
                    continue;
                };
                let mask = masks.get(key).cloned().unwrap_or_else(|| Some(FieldMask::empty()));
                match calculate_overlay_mutation(document, mask.as_ref()) {
                    Some(overlay) => {
                        overlays.insert(key.clone(), overlay);
                    }
                    None => self.txn.overlays.remove_overlay(key),
                }
            }
            self.txn.overlays.save_overlays(*batch_id, overlays);
        }

        documents
            .into_iter()
            .map(|(key, document)| {
                let mask = masks.remove(&key).unwrap_or_else(|| Some(FieldMask::empty()));
                (key, (document, mask))
            })
            .collect()
    }

    /// Local documents matching `query` that changed after `offset`. Every
    /// document with an overlay is considered regardless of the offset.
    pub fn get_documents_matching_query(
        &mut self,
        query: &Query,
        offset: &IndexOffset,
        context: &mut QueryContext,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        if query.is_document_query() {
            return self.get_documents_matching_document_query(query);
        }
        if let Some(group) = query.collection_group_id() {
            let group = group.to_string();
            let parents = self.txn.index_manager.get_collection_parents(&group);
            let mut results = BTreeMap::new();
            for parent in parents {
                if !query.path().is_prefix_of(&parent) {
                    continue;
                }
                let collection_query = query.as_collection_query_at_path(parent.child([group.as_str()]));
                results.extend(self.get_documents_matching_collection_query(&collection_query, offset, context));
            }
            return results;
        }
        self.get_documents_matching_collection_query(query, offset, context)
    }

    fn get_documents_matching_document_query(&mut self, query: &Query) -> BTreeMap<DocumentKey, MutableDocument> {
        let mut results = BTreeMap::new();
        if let Ok(key) = DocumentKey::from_path(query.path().clone()) {
            let document = self.get_document(&key);
            if document.is_found_document() {
                results.insert(key, document);
            }
        }
        results
    }

    fn get_documents_matching_collection_query(
        &mut self,
        query: &Query,
        offset: &IndexOffset,
        context: &mut QueryContext,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let overlays: BTreeMap<DocumentKey, Overlay> = self
            .txn
            .overlays
            .get_overlays_for_collection(query.path(), offset.largest_batch_id);
        let mutated_keys: BTreeSet<DocumentKey> = overlays.keys().cloned().collect();
        let mut documents =
            self.txn
                .remote_documents
                .get_documents_matching_query(query, offset, &mutated_keys, context);

        // Documents can start matching because of their overlay, so every
        // overlaid key is evaluated against its full remote state.
        for key in &mutated_keys {
            if !documents.contains_key(key) {
                documents.insert(key.clone(), self.txn.remote_documents.get_entry(key));
            }
        }

        documents
            .into_iter()
            .filter_map(|(key, document)| {
                let document = match overlays.get(&key) {
                    Some(overlay) => {
                        overlay
                            .mutation
                            .apply_to_local_view(document, Some(FieldMask::empty()), Timestamp::now())
                            .0
                    }
                    None => document,
                };
                query.matches(&document).then_some((key, document))
            })
            .collect()
    }
}
