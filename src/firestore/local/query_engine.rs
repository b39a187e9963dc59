use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::{LimitType, Query};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::{
    IndexOffset, IndexType, LocalDocumentsView, PersistenceTransaction, QueryContext,
};
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};

/// Tunables for the auto-indexing heuristic.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QueryEngineSettings {
    pub index_auto_creation_enabled: bool,
    /// Collections scanned with fewer reads than this never get an index.
    pub auto_index_min_documents: usize,
    /// An index is created once a scan reads more than this many documents
    /// per result.
    pub relative_index_read_cost_per_document: f64,
}

impl Default for QueryEngineSettings {
    fn default() -> Self {
        Self {
            index_auto_creation_enabled: false,
            auto_index_min_documents: 100,
            relative_index_read_cost_per_document: 2.0,
        }
    }
}

/// Answers queries from the local cache, choosing between an index scan,
/// reuse of the previous result and a full collection scan. Every strategy
/// returns the same documents for the same cache state.
#[derive(Clone, Debug, Default)]
pub struct QueryEngine {
    settings: QueryEngineSettings,
}

impl QueryEngine {
    pub fn new(settings: QueryEngineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &QueryEngineSettings {
        &self.settings
    }

    pub fn set_index_auto_creation_enabled(&mut self, enabled: bool) {
        self.settings.index_auto_creation_enabled = enabled;
    }

    /// Documents matching `query`, sorted and limited, with local overlays
    /// applied.
    pub fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<Vec<MutableDocument>> {
        if let Some(results) = self.perform_query_using_index(txn, query) {
            return Ok(results);
        }
        if let Some(results) =
            self.perform_query_using_remote_keys(txn, query, remote_keys, last_limbo_free_snapshot_version)
        {
            return Ok(results);
        }

        let mut context = QueryContext::default();
        let results = self.execute_full_collection_scan(txn, query, &mut context);
        if self.settings.index_auto_creation_enabled {
            self.create_cache_indexes(txn, query, &context, results.len())?;
        }
        Ok(results)
    }

    /// Index-assisted scan. `None` when no index serves the query.
    pub fn perform_query_using_index(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
    ) -> Option<Vec<MutableDocument>> {
        if query.matches_all_documents() {
            return None;
        }
        let target = query.to_target();
        let index_type = txn.index_manager.get_index_type(&target);
        if index_type == IndexType::None {
            return None;
        }
        if index_type == IndexType::Partial && query.has_limit() {
            // The index cannot rank the results, so rank all of them here.
            let results = self.perform_query_using_index(txn, &query.without_limit())?;
            return Some(query.apply_to_documents(results));
        }

        let keys: BTreeSet<DocumentKey> = txn
            .index_manager
            .get_documents_matching_target(&target)?
            .into_iter()
            .collect();
        let offset = txn.index_manager.get_min_offset(&target);
        log::debug!(
            "query engine: using {:?} index for {} ({} keys)",
            index_type,
            query.canonical_id(),
            keys.len()
        );

        let mut view = LocalDocumentsView::new(txn);
        let indexed = view.get_documents(&keys);
        Some(self.append_remaining_results(&mut view, indexed, query, &offset))
    }

    /// Re-derives the result from the keys the backend last reported for the
    /// target plus documents changed since the target was last limbo free.
    pub fn perform_query_using_remote_keys(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        remote_keys: &BTreeSet<DocumentKey>,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> Option<Vec<MutableDocument>> {
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return None;
        }

        let mut view = LocalDocumentsView::new(txn);
        let documents = view.get_documents(remote_keys);
        let previous_results = query.without_limit().apply_to_documents(documents.values().cloned());
        if query.has_limit()
            && Self::needs_refill(query, &previous_results, remote_keys, last_limbo_free_snapshot_version)
        {
            return None;
        }

        log::debug!(
            "query engine: re-using previous result from {} for {}",
            last_limbo_free_snapshot_version,
            query.canonical_id()
        );
        let offset = IndexOffset::from_read_time(last_limbo_free_snapshot_version);
        let previous: BTreeMap<DocumentKey, MutableDocument> = previous_results
            .into_iter()
            .map(|document| (document.key().clone(), document))
            .collect();
        Some(self.append_remaining_results(&mut view, previous, query, &offset))
    }

    pub fn execute_full_collection_scan(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        context: &mut QueryContext,
    ) -> Vec<MutableDocument> {
        log::debug!("query engine: full collection scan for {}", query.canonical_id());
        let documents = LocalDocumentsView::new(txn).get_documents_matching_query(query, &IndexOffset::none(), context);
        query.apply_to_documents(documents.into_values())
    }

    /// Whether the previous result may miss documents at the limit edge: a
    /// document left the result, or the edge document changed after the
    /// result was computed.
    fn needs_refill(
        query: &Query,
        sorted_previous_results: &[MutableDocument],
        remote_keys: &BTreeSet<DocumentKey>,
        limbo_free_snapshot_version: SnapshotVersion,
    ) -> bool {
        if remote_keys.len() != sorted_previous_results.len() {
            return true;
        }
        let edge = match query.limit_type() {
            LimitType::First => sorted_previous_results.last(),
            LimitType::Last => sorted_previous_results.first(),
        };
        match edge {
            Some(document) => {
                document.has_pending_writes() || document.version() > limbo_free_snapshot_version
            }
            None => false,
        }
    }

    fn append_remaining_results(
        &self,
        view: &mut LocalDocumentsView<'_, '_>,
        indexed: BTreeMap<DocumentKey, MutableDocument>,
        query: &Query,
        offset: &IndexOffset,
    ) -> Vec<MutableDocument> {
        let mut remaining = view.get_documents_matching_query(query, offset, &mut QueryContext::default());
        for (key, document) in indexed {
            remaining.entry(key).or_insert(document);
        }
        query.apply_to_documents(remaining.into_values())
    }

    fn create_cache_indexes(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        context: &QueryContext,
        result_size: usize,
    ) -> FirestoreResult<()> {
        let reads = context.documents_read_count;
        if reads <= self.settings.auto_index_min_documents {
            log::trace!(
                "query engine: not creating an index, {reads} reads is below the minimum of {}",
                self.settings.auto_index_min_documents
            );
            return Ok(());
        }
        if reads as f64 > self.settings.relative_index_read_cost_per_document * result_size as f64 {
            log::debug!(
                "query engine: creating an index for {} after reading {reads} documents for {result_size} results",
                query.canonical_id()
            );
            txn.index_manager.create_target_indexes(&query.to_target())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Filter, Operator, OrderBy};
    use crate::firestore::local::memory::MemoryPersistence;
    use crate::firestore::local::{
        FieldIndex, IndexKind, IndexSegment, Persistence, TransactionMode,
    };
    use crate::firestore::model::{FieldPath, ResourcePath, Timestamp};
    use crate::firestore::value::{FirestoreValue, ObjectValue};

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str, value: i64, seconds: i64) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(&field("a"), FirestoreValue::from_integer(value));
        MutableDocument::new_found_document(DocumentKey::from_string(path).unwrap(), version(seconds), data)
    }

    fn query() -> Query {
        Query::collection(ResourcePath::from_string("c").unwrap())
            .with_filter(Filter::field(field("a"), Operator::GreaterThan, FirestoreValue::from_integer(1)))
            .with_order_by(OrderBy::ascending(field("a")))
    }

    #[test]
    fn full_scan_triggers_auto_indexing_for_selective_queries() {
        let persistence = MemoryPersistence::new();
        persistence.start().unwrap();
        let persistence: &dyn Persistence = &persistence;
        let engine = QueryEngine::new(QueryEngineSettings {
            index_auto_creation_enabled: true,
            auto_index_min_documents: 3,
            relative_index_read_cost_per_document: 2.0,
        });

        let (results, index_count) = persistence
            .run("test", TransactionMode::ReadWrite, |txn| {
                for i in 0..8 {
                    let value = if i == 0 { 5 } else { 0 };
                    txn.remote_documents.add_entry(doc(&format!("c/{i}"), value, 1), version(1))?;
                }
                let results =
                    engine.get_documents_matching_query(txn, &query(), SnapshotVersion::min(), &BTreeSet::new())?;
                Ok((results, txn.index_manager.get_field_indexes(Some("c")).len()))
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(index_count, 1);
    }

    #[test]
    fn index_scan_includes_documents_after_the_offset() {
        let persistence = MemoryPersistence::new();
        persistence.start().unwrap();
        let persistence: &dyn Persistence = &persistence;
        let engine = QueryEngine::default();

        let (indexed, scanned) = persistence
            .run("test", TransactionMode::ReadWrite, |txn| {
                txn.index_manager.add_field_index(FieldIndex::new(
                    "c",
                    vec![IndexSegment::new(field("a"), IndexKind::Ascending)],
                ))?;
                txn.remote_documents.add_entry(doc("c/1", 2, 1), version(1))?;
                let first = txn.remote_documents.get_entries(&BTreeSet::from([DocumentKey::from_string("c/1").unwrap()]));
                txn.index_manager.update_index_entries(&first);
                txn.index_manager.update_collection_group("c", IndexOffset::from_read_time(version(1)));
                txn.remote_documents.add_entry(doc("c/2", 3, 2), version(2))?;

                let indexed = engine.perform_query_using_index(txn, &query());
                let scanned = engine.execute_full_collection_scan(txn, &query(), &mut QueryContext::default());
                Ok((indexed, scanned))
            })
            .unwrap();
        assert_eq!(indexed, Some(scanned));
    }

    fn keys(paths: &[&str]) -> BTreeSet<DocumentKey> {
        paths.iter().map(|path| DocumentKey::from_string(path).unwrap()).collect()
    }

    #[test]
    fn previous_result_is_reused_until_the_limit_edge_changes() {
        let persistence = MemoryPersistence::new();
        persistence.start().unwrap();
        let persistence: &dyn Persistence = &persistence;
        let engine = QueryEngine::default();
        let first = query().limit_to_first(2);
        let last = query().limit_to_last(2);

        persistence
            .run("test", TransactionMode::ReadWrite, |txn| {
                for (path, value) in [("c/1", 2), ("c/2", 3), ("c/3", 4)] {
                    txn.remote_documents.add_entry(doc(path, value, 1), version(1))?;
                }
                for (limited, synced) in [(&first, keys(&["c/1", "c/2"])), (&last, keys(&["c/2", "c/3"]))] {
                    let reused = engine.perform_query_using_remote_keys(txn, limited, &synced, version(1));
                    let scanned = engine.execute_full_collection_scan(txn, limited, &mut QueryContext::default());
                    assert_eq!(reused, Some(scanned));
                }

                // A synced key that no longer matches leaves a gap at the edge.
                let gapped = engine.perform_query_using_remote_keys(txn, &first, &keys(&["c/1", "c/9"]), version(1));
                assert!(gapped.is_none());

                // The shared edge document changes after the snapshot.
                txn.remote_documents.add_entry(doc("c/2", 3, 2), version(2))?;
                for (limited, synced) in [(&first, keys(&["c/1", "c/2"])), (&last, keys(&["c/2", "c/3"]))] {
                    assert!(engine
                        .perform_query_using_remote_keys(txn, limited, &synced, version(1))
                        .is_none());
                    let answered =
                        engine.get_documents_matching_query(txn, limited, version(1), &synced)?;
                    let scanned = engine.execute_full_collection_scan(txn, limited, &mut QueryContext::default());
                    assert_eq!(answered, scanned);
                }
                Ok(())
            })
            .unwrap();
    }
}
