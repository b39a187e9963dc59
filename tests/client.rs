use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value as JsonValue};

use firestore_sync::firestore::core::{ClientComponents, FirestoreClient, ListenOptions, ListenSource, Query};
use firestore_sync::firestore::error::{permission_denied, FirestoreErrorCode, FirestoreResult};
use firestore_sync::firestore::model::{DatabaseId, DocumentKey, FieldPath, Mutation, ResourcePath, SnapshotVersion};
use firestore_sync::firestore::remote::{
    InMemoryDatastore, InMemoryTransport, JsonProtoSerializer, MultiplexedConnection, MultiplexedStream, StreamKind,
};
use firestore_sync::firestore::util::TimerId;
use firestore_sync::firestore::value::{FirestoreValue, ObjectValue};
use firestore_sync::firestore::ViewSnapshot;

type Recorded = Arc<Mutex<Vec<FirestoreResult<ViewSnapshot>>>>;

struct Backend {
    server: MultiplexedConnection,
    serializer: JsonProtoSerializer,
    datastore: InMemoryDatastore,
}

async fn start_client() -> (FirestoreClient, Backend) {
    let (client_transport, server_transport) = InMemoryTransport::pair();
    let database_id = DatabaseId::default_for("p");
    let datastore = InMemoryDatastore::new();
    let components = ClientComponents::new(
        database_id.clone(),
        Arc::new(MultiplexedConnection::new(client_transport)),
        Arc::new(datastore.clone()),
    );
    let client = FirestoreClient::start(components).await.unwrap();
    let backend = Backend {
        server: MultiplexedConnection::new(server_transport),
        serializer: JsonProtoSerializer::new(database_id),
        datastore,
    };
    (client, backend)
}

impl Backend {
    async fn accept(&self, kind: StreamKind) -> MultiplexedStream {
        let incoming = tokio::time::timeout(Duration::from_secs(2), self.server.accept())
            .await
            .expect("stream opened")
            .unwrap();
        assert_eq!(incoming.kind, kind);
        incoming.stream
    }
}

async fn read_json(stream: &MultiplexedStream) -> JsonValue {
    let payload = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("message arrived")
        .expect("stream open")
        .unwrap();
    serde_json::from_slice(&payload).unwrap()
}

async fn send_json(stream: &MultiplexedStream, message: JsonValue) {
    stream.send(serde_json::to_vec(&message).unwrap()).await.unwrap();
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn rooms() -> Query {
    Query::collection(ResourcePath::from_string("rooms").unwrap())
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn data(value: i64) -> ObjectValue {
    let mut data = ObjectValue::empty();
    data.set(&FieldPath::from_dot_separated("n").unwrap(), FirestoreValue::from_integer(value));
    data
}

fn recorder() -> (Recorded, firestore_sync::firestore::core::QueryCallback) {
    let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&recorded);
    (recorded, Arc::new(move |event| sink.lock().unwrap().push(event)))
}

fn snapshots(recorded: &Recorded) -> Vec<ViewSnapshot> {
    recorded
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| event.as_ref().ok().cloned())
        .collect()
}

fn keys(snapshot: &ViewSnapshot) -> Vec<String> {
    snapshot
        .docs
        .iter()
        .map(|doc| doc.key().path().canonical_string())
        .collect()
}

#[tokio::test]
async fn watch_results_and_acknowledged_writes_reach_the_listener() {
    let (client, backend) = start_client().await;
    let (recorded, callback) = recorder();
    let _registration = client.listen(rooms(), ListenOptions::default(), callback).await.unwrap();

    let watch = backend.accept(StreamKind::Listen).await;
    let request = read_json(&watch).await;
    assert_eq!(request["addTarget"]["targetId"], json!(2));

    let read_time = backend.serializer.encode_version(SnapshotVersion::from_micros(1_000_000));
    send_json(&watch, json!({"targetChange": {"targetChangeType": "ADD", "targetIds": [2]}})).await;
    send_json(
        &watch,
        json!({"documentChange": {
            "document": {
                "name": backend.serializer.document_name(&key("rooms/a")),
                "fields": {},
                "updateTime": read_time,
            },
            "targetIds": [2],
        }}),
    )
    .await;
    send_json(
        &watch,
        json!({"targetChange": {"targetChangeType": "CURRENT", "targetIds": [2], "resumeToken": "dG9rZW4="}}),
    )
    .await;
    send_json(&watch, json!({"targetChange": {"readTime": read_time}})).await;

    wait_until(|| !snapshots(&recorded).is_empty()).await;
    let first = snapshots(&recorded)[0].clone();
    assert!(!first.from_cache);
    assert_eq!(keys(&first), vec!["rooms/a"]);

    let writer = client.clone();
    let write = tokio::spawn(async move { writer.write(vec![Mutation::set(key("rooms/b"), data(1))]).await });

    wait_until(|| snapshots(&recorded).len() >= 2).await;
    let optimistic = snapshots(&recorded)[1].clone();
    assert_eq!(keys(&optimistic), vec!["rooms/a", "rooms/b"]);
    assert!(optimistic.has_pending_writes());

    let stream = backend.accept(StreamKind::Write).await;
    read_json(&stream).await;
    send_json(&stream, json!({"streamToken": "AQ=="})).await;
    let request = read_json(&stream).await;
    assert_eq!(request["writes"].as_array().map(Vec::len), Some(1));
    let commit_time = backend.serializer.encode_version(SnapshotVersion::from_micros(2_000_000));
    send_json(
        &stream,
        json!({"streamToken": "Ag==", "commitTime": commit_time, "writeResults": [{"updateTime": commit_time}]}),
    )
    .await;

    tokio::time::timeout(Duration::from_secs(2), write)
        .await
        .expect("write acknowledged")
        .unwrap()
        .unwrap();
    client.wait_for_pending_writes().await.unwrap();
}

#[tokio::test]
async fn rejected_write_is_rolled_back_for_cache_listeners() {
    let (client, backend) = start_client().await;
    let (recorded, callback) = recorder();
    let options = ListenOptions::default().with_source(ListenSource::Cache);
    let _registration = client.listen(rooms(), options, callback).await.unwrap();

    wait_until(|| !snapshots(&recorded).is_empty()).await;
    assert!(snapshots(&recorded)[0].docs.is_empty());

    let writer = client.clone();
    let write = tokio::spawn(async move { writer.write(vec![Mutation::set(key("rooms/a"), data(1))]).await });
    wait_until(|| snapshots(&recorded).len() >= 2).await;
    assert_eq!(keys(&snapshots(&recorded)[1]), vec!["rooms/a"]);

    let stream = backend.accept(StreamKind::Write).await;
    read_json(&stream).await;
    send_json(&stream, json!({"streamToken": "AQ=="})).await;
    read_json(&stream).await;
    stream.fail(permission_denied("read only")).await.unwrap();

    let error = tokio::time::timeout(Duration::from_secs(2), write)
        .await
        .expect("write rejected")
        .unwrap()
        .unwrap_err();
    assert_eq!(error.code, FirestoreErrorCode::PermissionDenied);

    wait_until(|| snapshots(&recorded).len() >= 3).await;
    assert!(snapshots(&recorded)[2].docs.is_empty());
}

#[tokio::test]
async fn offline_writes_are_served_from_the_local_cache() {
    let (client, _backend) = start_client().await;
    client.disable_network().await.unwrap();

    let writer = client.clone();
    let _pending = tokio::spawn(async move { writer.write(vec![Mutation::set(key("rooms/a"), data(7))]).await });

    wait_until(|| client.sync_engine().local_store().get_highest_unacknowledged_batch_id().ok() == Some(1)).await;

    let snapshot = client.get_documents_from_local_cache(rooms()).await.unwrap();
    assert_eq!(keys(&snapshot), vec!["rooms/a"]);
    assert!(snapshot.from_cache);
    assert!(snapshot.has_pending_writes());

    let document = client.get_document_from_local_cache(key("rooms/a")).await.unwrap().unwrap();
    assert!(document.has_local_mutations());
    assert_eq!(document.data(), &data(7));
}

#[tokio::test]
async fn transactions_commit_through_the_datastore() {
    let (client, backend) = start_client().await;
    backend.datastore.seed(key("counters/a"), data(1));

    let result = client
        .run_transaction(|transaction| async move {
            let docs = transaction.lookup(&[key("counters/a")]).await?;
            assert!(docs[0].is_found_document());
            transaction.set(key("counters/a"), data(2)).await?;
            Ok("done")
        })
        .await
        .unwrap();

    assert_eq!(result, "done");
    assert_eq!(backend.datastore.get(&key("counters/a")).unwrap().data(), &data(2));
}

#[tokio::test]
async fn terminated_client_rejects_new_calls() {
    let (client, _backend) = start_client().await;
    client.terminate().await.unwrap();
    client.terminate().await.unwrap();

    assert!(client.is_terminated());
    let error = client.get_documents_from_local_cache(rooms()).await.unwrap_err();
    assert_eq!(error.code, FirestoreErrorCode::FailedPrecondition);
    let error = client.enable_network().await.unwrap_err();
    assert_eq!(error.code, FirestoreErrorCode::FailedPrecondition);
}

#[tokio::test]
async fn maintenance_timers_reschedule_themselves() {
    let (client, _backend) = start_client().await;
    let queue = client.async_queue();
    assert!(queue.contains_delayed_operation(TimerId::IndexBackfill));
    assert!(queue.contains_delayed_operation(TimerId::GarbageCollection));

    queue.run_all_delayed_operations_until(TimerId::GarbageCollection).await.unwrap();
    assert!(queue.contains_delayed_operation(TimerId::IndexBackfill));
    assert!(queue.contains_delayed_operation(TimerId::GarbageCollection));

    client.terminate().await.unwrap();
}
