use std::collections::BTreeSet;
use std::sync::Arc;

use firestore_sync::firestore::core::{Filter, Operator, OrderBy, Query};
use firestore_sync::firestore::error::{failed_precondition, primary_lease_lost, FirestoreErrorCode, FirestoreResult};
use firestore_sync::firestore::local::memory::MemoryPersistence;
use firestore_sync::firestore::local::{
    ignore_if_primary_lease_loss, FieldIndex, IndexKind, IndexSegment, LocalStore, LocalViewChanges, QueryEngineSettings,
};
use firestore_sync::firestore::model::{
    DocumentKey, FieldMask, FieldPath, MutableDocument, Mutation, ResourcePath, SnapshotVersion, Timestamp,
};
use firestore_sync::firestore::remote::{RemoteEvent, TargetChange};
use firestore_sync::firestore::value::{FirestoreValue, ObjectValue};

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn field(path: &str) -> FieldPath {
    FieldPath::from_dot_separated(path).unwrap()
}

fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

fn object(entries: &[(&str, i64)]) -> ObjectValue {
    let mut data = ObjectValue::empty();
    for (name, value) in entries {
        data.set(&field(name), FirestoreValue::from_integer(*value));
    }
    data
}

fn local_store() -> LocalStore {
    let store = LocalStore::new(Arc::new(MemoryPersistence::new()), QueryEngineSettings::default(), None);
    store.start().unwrap();
    store
}

fn scores() -> Query {
    Query::collection(ResourcePath::from_string("scores").unwrap())
}

/// Delivers `documents` through a target for the whole collection at
/// `seconds`.
fn receive(store: &LocalStore, seconds: i64, documents: &[(&str, i64)]) {
    let target = store.allocate_target(scores().to_target()).unwrap();
    let mut event = RemoteEvent::new(version(seconds));
    let mut change = TargetChange::default();
    for (path, value) in documents {
        change.added_documents.insert(key(path));
        event.document_updates.insert(
            key(path),
            MutableDocument::new_found_document(key(path), version(seconds), object(&[("score", *value)])),
        );
    }
    event.target_changes.insert(target.target_id, change);
    store.apply_remote_event(&event).unwrap();
}

/// Updates and deletes documents through the collection target at
/// `seconds`.
fn change_remotely(store: &LocalStore, seconds: i64, updated: &[(&str, i64)], deleted: &[&str]) {
    let target = store.allocate_target(scores().to_target()).unwrap();
    let mut event = RemoteEvent::new(version(seconds));
    let mut change = TargetChange::default();
    for (path, value) in updated {
        change.modified_documents.insert(key(path));
        event.document_updates.insert(
            key(path),
            MutableDocument::new_found_document(key(path), version(seconds), object(&[("score", *value)])),
        );
    }
    for path in deleted {
        change.removed_documents.insert(key(path));
        event
            .document_updates
            .insert(key(path), MutableDocument::new_no_document(key(path), version(seconds)));
    }
    event.target_changes.insert(target.target_id, change);
    store.apply_remote_event(&event).unwrap();
}

/// Marks the current result of `query` as synced with the backend at
/// `seconds`, the way a view that turned current does.
fn sync_query(store: &LocalStore, query: &Query, seconds: i64) {
    let target = store.allocate_target(query.to_target()).unwrap();
    let result = store.execute_query(query, false).unwrap();
    let keys: BTreeSet<DocumentKey> = result.documents.iter().map(|doc| doc.key().clone()).collect();

    let mut event = RemoteEvent::new(version(seconds));
    event.target_changes.insert(
        target.target_id,
        TargetChange {
            resume_token: vec![1],
            current: true,
            added_documents: keys.clone(),
            removed_documents: result.remote_keys.difference(&keys).cloned().collect(),
            ..TargetChange::default()
        },
    );
    store.apply_remote_event(&event).unwrap();
    store
        .notify_local_view_changes(&[LocalViewChanges {
            target_id: target.target_id,
            from_cache: false,
            removed_keys: result.remote_keys.difference(&keys).cloned().collect(),
            added_keys: keys,
        }])
        .unwrap();
}

fn keys_of(store: &LocalStore, query: &Query, use_previous_results: bool) -> Vec<String> {
    store
        .execute_query(query, use_previous_results)
        .unwrap()
        .documents
        .iter()
        .map(|doc| doc.key().path().canonical_string())
        .collect()
}

fn result_keys(store: &LocalStore, query: &Query) -> Vec<String> {
    keys_of(store, query, false)
}

/// Runs `query` from the synced result and from a full scan and checks
/// that both agree.
fn agreed_keys(store: &LocalStore, query: &Query) -> Vec<String> {
    let scanned = keys_of(store, query, false);
    assert_eq!(keys_of(store, query, true), scanned, "{}", query.canonical_id());
    scanned
}

fn by_score() -> Query {
    scores().with_order_by(OrderBy::ascending(field("score")))
}

const SCORES: [(&str, i64); 5] =
    [("scores/a", 3), ("scores/b", 9), ("scores/c", 5), ("scores/d", 1), ("scores/e", 7)];

#[test]
fn indexed_and_scanned_queries_return_the_same_documents() {
    let documents = [("scores/a", 3), ("scores/b", 9), ("scores/c", 5), ("scores/d", 1), ("scores/e", 7)];
    let scanned = local_store();
    let indexed = local_store();
    indexed
        .configure_field_indexes(vec![FieldIndex::new(
            "scores",
            vec![IndexSegment::new(field("score"), IndexKind::Ascending)],
        )])
        .unwrap();

    for store in [&scanned, &indexed] {
        receive(store, 1, &documents);
        store
            .write_locally(vec![Mutation::patch(
                key("scores/d"),
                object(&[("score", 8)]),
                FieldMask::new([field("score")]),
            )])
            .unwrap();
        store.write_locally(vec![Mutation::delete(key("scores/b"))]).unwrap();
    }
    assert!(indexed.backfill_indexes(100).unwrap() > 0);

    let query = scores()
        .with_filter(Filter::field(field("score"), Operator::GreaterThanOrEqual, FirestoreValue::from_integer(4)))
        .with_order_by(OrderBy::ascending(field("score")));
    assert_eq!(result_keys(&scanned, &query), vec!["scores/c", "scores/e", "scores/d"]);
    assert_eq!(result_keys(&indexed, &query), result_keys(&scanned, &query));
}

#[test]
fn local_view_applies_pending_batches_in_order() {
    let store = local_store();
    receive(&store, 1, &[("scores/a", 1)]);

    let first = store
        .write_locally(vec![Mutation::set(key("scores/a"), object(&[("score", 2), ("bonus", 1)]))])
        .unwrap();
    let second = store
        .write_locally(vec![Mutation::patch(
            key("scores/a"),
            object(&[("score", 3)]),
            FieldMask::new([field("score")]),
        )])
        .unwrap();

    let document = store.read_document(&key("scores/a")).unwrap();
    assert!(document.has_local_mutations());
    assert_eq!(document.data(), &object(&[("score", 3), ("bonus", 1)]));

    store.reject_batch(second.batch_id).unwrap();
    assert_eq!(store.read_document(&key("scores/a")).unwrap().data(), &object(&[("score", 2), ("bonus", 1)]));

    store.reject_batch(first.batch_id).unwrap();
    let document = store.read_document(&key("scores/a")).unwrap();
    assert!(!document.has_local_mutations());
    assert_eq!(document.data(), &object(&[("score", 1)]));
}

#[test]
fn remote_snapshot_version_never_goes_backwards() {
    let store = local_store();
    receive(&store, 5, &[("scores/a", 1)]);
    assert_eq!(store.get_last_remote_snapshot_version().unwrap(), version(5));

    let mut older = RemoteEvent::new(version(3));
    older.document_updates.insert(
        key("scores/a"),
        MutableDocument::new_found_document(key("scores/a"), version(3), object(&[("score", 0)])),
    );
    let error = store.apply_remote_event(&older).unwrap_err();
    assert_eq!(error.code, FirestoreErrorCode::Internal);
    assert_eq!(store.read_document(&key("scores/a")).unwrap().version(), version(5));
    assert_eq!(store.get_last_remote_snapshot_version().unwrap(), version(5));
}

#[test]
fn synced_limit_to_first_result_matches_a_full_scan() {
    let store = local_store();
    receive(&store, 1, &SCORES);
    let query = by_score().limit_to_first(2);
    sync_query(&store, &query, 2);
    assert_eq!(agreed_keys(&store, &query), vec!["scores/d", "scores/a"]);

    // A pending write pushes the last document out of the limit.
    store
        .write_locally(vec![Mutation::patch(
            key("scores/a"),
            object(&[("score", 20)]),
            FieldMask::new([field("score")]),
        )])
        .unwrap();
    assert_eq!(agreed_keys(&store, &query), vec!["scores/d", "scores/c"]);

    // A document outside the synced result moves into it.
    change_remotely(&store, 3, &[("scores/e", 2)], &[]);
    assert_eq!(agreed_keys(&store, &query), vec!["scores/d", "scores/e"]);
}

#[test]
fn synced_limit_to_last_result_refills_after_a_remote_delete() {
    let store = local_store();
    receive(&store, 1, &SCORES);
    let query = by_score().limit_to_last(2);
    sync_query(&store, &query, 2);
    assert_eq!(agreed_keys(&store, &query), vec!["scores/e", "scores/b"]);

    change_remotely(&store, 3, &[], &["scores/b"]);
    assert_eq!(agreed_keys(&store, &query), vec!["scores/c", "scores/e"]);

    // A newer version of the edge document also forces a refill.
    sync_query(&store, &query, 3);
    change_remotely(&store, 4, &[("scores/e", 0)], &[]);
    assert_eq!(agreed_keys(&store, &query), vec!["scores/a", "scores/c"]);
}

#[test]
fn lost_primary_lease_is_swallowed_but_other_errors_pass_through() {
    assert_eq!(ignore_if_primary_lease_loss(Ok(7)).unwrap(), Some(7));
    assert_eq!(ignore_if_primary_lease_loss::<()>(Err(primary_lease_lost())).unwrap(), None);

    let other: FirestoreResult<()> = Err(failed_precondition("index missing"));
    let error = ignore_if_primary_lease_loss(other).unwrap_err();
    assert_eq!(error.code, FirestoreErrorCode::FailedPrecondition);
}
