use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::firestore::error::{internal_error, invalid_argument, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion, TargetId};
use crate::firestore::remote::serializer::JsonProtoSerializer;

/// One decoded message of the watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange {
    Document(DocumentWatchChange),
    Target(WatchTargetChange),
    ExistenceFilter(ExistenceFilterChange),
}

/// A document entered, changed in or left some targets. `new_doc` is `None`
/// when the document was only removed from targets without a known state.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    pub new_doc: Option<MutableDocument>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty means every active target.
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    pub read_time: SnapshotVersion,
    /// Set when the backend rejected the listen.
    pub cause: Option<FirestoreError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub existence_filter: ExistenceFilter,
}

/// Document count the backend has for a target, optionally with a bloom
/// filter over the names of the unchanged documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistenceFilter {
    pub count: i32,
    pub unchanged_names: Option<BloomFilterParameters>,
}

impl ExistenceFilter {
    pub fn new(count: i32) -> Self {
        Self {
            count,
            unchanged_names: None,
        }
    }
}

/// Raw bloom filter fields as sent on the wire, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BloomFilterParameters {
    pub bitmap: Vec<u8>,
    pub padding: i32,
    pub hash_count: i32,
}

#[derive(Debug, Deserialize)]
struct StatusCause {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: Option<String>,
}

pub fn decode_watch_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(serializer, target_change).map(Some);
    }

    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change).map(Some);
    }

    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_delete(serializer, document_delete).map(Some);
    }

    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_remove(serializer, document_remove).map(Some);
    }

    if let Some(filter) = value.get("filter") {
        return decode_filter_change(serializer, filter).map(Some);
    }

    Ok(None)
}

/// Snapshot version a watch message stamps, if any. Only global
/// `NO_CHANGE` target changes (no target ids) mark a consistent snapshot.
pub fn snapshot_version_of(change: &WatchChange) -> Option<SnapshotVersion> {
    match change {
        WatchChange::Target(change)
            if change.state == TargetChangeState::NoChange && change.target_ids.is_empty() =>
        {
            Some(change.read_time)
        }
        _ => None,
    }
}

fn decode_target_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let target_ids = numeric_array(value.get("targetIds"));

    let resume_token = match value.get("resumeToken").and_then(JsonValue::as_str) {
        Some(token) => serializer.decode_bytes(token)?,
        None => Vec::new(),
    };

    let read_time = serializer.decode_optional_version(value.get("readTime"))?;

    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or(TargetChangeState::NoChange);

    let cause = value
        .get("cause")
        .map(|cause| serde_json::from_value::<StatusCause>(cause.clone()))
        .transpose()
        .map_err(|err| internal_error(format!("Failed to decode watch cause: {err}")))?
        .map(|cause| map_grpc_status(cause.code, cause.message));

    Ok(WatchChange::Target(WatchTargetChange {
        state,
        target_ids,
        resume_token,
        read_time,
        cause,
    }))
}

fn decode_document_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let doc = serializer.decode_document(document)?;

    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: numeric_array(value.get("targetIds")),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key: doc.key().clone(),
        new_doc: Some(doc),
    }))
}

fn decode_document_delete(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentDelete")?;
    let read_time = serializer.decode_optional_version(value.get("readTime"))?;
    let doc = MutableDocument::new_no_document(key.clone(), read_time);

    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key,
        new_doc: Some(doc),
    }))
}

fn decode_document_remove(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentRemove")?;

    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key,
        new_doc: None,
    }))
}

fn decode_filter_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .unwrap_or_default() as TargetId;
    let count = value
        .get("count")
        .and_then(JsonValue::as_i64)
        .unwrap_or_default() as i32;

    let unchanged_names = match value.get("unchangedNames") {
        Some(names) => Some(decode_bloom_filter(serializer, names)?),
        None => None,
    };

    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        existence_filter: ExistenceFilter {
            count,
            unchanged_names,
        },
    }))
}

fn decode_bloom_filter(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<BloomFilterParameters> {
    let bits = value.get("bits");
    let bitmap = match bits
        .and_then(|bits| bits.get("bitmap"))
        .and_then(JsonValue::as_str)
    {
        Some(encoded) => serializer.decode_bytes(encoded)?,
        None => Vec::new(),
    };
    let padding = bits
        .and_then(|bits| bits.get("padding"))
        .and_then(JsonValue::as_i64)
        .unwrap_or_default() as i32;
    let hash_count = value
        .get("hashCount")
        .and_then(JsonValue::as_i64)
        .unwrap_or_default() as i32;

    Ok(BloomFilterParameters {
        bitmap,
        padding,
        hash_count,
    })
}

fn document_key(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
    kind: &str,
) -> FirestoreResult<DocumentKey> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument(format!("{kind} missing document")))?;
    serializer.document_key_from_name(name)
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|value| value as TargetId))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

fn target_state_from_str(value: &str) -> TargetChangeState {
    match value {
        "ADD" => TargetChangeState::Add,
        "REMOVE" => TargetChangeState::Remove,
        "CURRENT" => TargetChangeState::Current,
        "RESET" => TargetChangeState::Reset,
        _ => TargetChangeState::NoChange,
    }
}

fn map_grpc_status(code: i32, message: Option<String>) -> FirestoreError {
    let message = message.unwrap_or_else(|| "watch stream error".to_string());
    FirestoreError::new(FirestoreErrorCode::from_rpc_status(code), message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::DatabaseId;
    use serde_json::json;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::default_for("project"))
    }

    #[test]
    fn decodes_target_change() {
        let change = json!({
            "targetChange": {
                "targetIds": [1, 2],
                "resumeToken": "AQID",
                "targetChangeType": "CURRENT"
            }
        });

        let decoded = decode_watch_change(&serializer(), &change).unwrap().unwrap();
        match decoded {
            WatchChange::Target(change) => {
                assert_eq!(change.target_ids, vec![1, 2]);
                assert_eq!(change.resume_token, vec![1, 2, 3]);
                assert_eq!(change.state, TargetChangeState::Current);
                assert!(change.cause.is_none());
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn decodes_listen_rejection_cause() {
        let change = json!({
            "targetChange": {
                "targetIds": [4],
                "targetChangeType": "REMOVE",
                "cause": { "code": 7, "message": "denied" }
            }
        });
        let Some(WatchChange::Target(change)) = decode_watch_change(&serializer(), &change).unwrap() else {
            panic!("expected target change");
        };
        let cause = change.cause.unwrap();
        assert_eq!(cause.code, FirestoreErrorCode::PermissionDenied);
        assert_eq!(cause.message(), "denied");
    }

    #[test]
    fn document_delete_becomes_no_document_at_read_time() {
        let change = json!({
            "documentDelete": {
                "document": "projects/project/databases/(default)/documents/rooms/eros",
                "readTime": "1970-01-01T00:00:02Z",
                "removedTargetIds": [2]
            }
        });
        let Some(WatchChange::Document(change)) = decode_watch_change(&serializer(), &change).unwrap() else {
            panic!("expected document change");
        };
        let doc = change.new_doc.unwrap();
        assert!(doc.is_no_document());
        assert_eq!(doc.version(), SnapshotVersion::from_micros(2_000_000));
        assert_eq!(change.removed_target_ids, vec![2]);
    }

    #[test]
    fn decodes_existence_filter_with_bloom_filter() {
        let change = json!({
            "filter": {
                "targetId": 2,
                "count": 3,
                "unchangedNames": {
                    "bits": { "bitmap": "AQI=", "padding": 1 },
                    "hashCount": 4
                }
            }
        });
        let Some(WatchChange::ExistenceFilter(change)) = decode_watch_change(&serializer(), &change).unwrap() else {
            panic!("expected filter");
        };
        assert_eq!(change.target_id, 2);
        assert_eq!(change.existence_filter.count, 3);
        assert_eq!(
            change.existence_filter.unchanged_names,
            Some(BloomFilterParameters {
                bitmap: vec![1, 2],
                padding: 1,
                hash_count: 4
            })
        );
    }

    #[test]
    fn only_global_no_change_marks_a_snapshot() {
        let global = WatchChange::Target(WatchTargetChange {
            state: TargetChangeState::NoChange,
            target_ids: vec![],
            resume_token: vec![],
            read_time: SnapshotVersion::from_micros(7),
            cause: None,
        });
        assert_eq!(snapshot_version_of(&global), Some(SnapshotVersion::from_micros(7)));

        let scoped = WatchChange::Target(WatchTargetChange {
            state: TargetChangeState::NoChange,
            target_ids: vec![1],
            resume_token: vec![],
            read_time: SnapshotVersion::from_micros(7),
            cause: None,
        });
        assert_eq!(snapshot_version_of(&scoped), None);
    }
}
