use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::{
    DatabaseId, DocumentKey, FieldTransform, GeoPoint, Mutation, MutableDocument, MutationResult,
    Precondition, ResourcePath, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::firestore::remote::structured_query::encode_query_target;
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue, ObjectValue, ValueKind};

const VECTOR_TYPE: &str = "__vector__";
const SERVER_TIMESTAMP_TYPE: &str = "server_timestamp";

/// Result of one write stream response.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
}

/// Translates between the model and the JSON mapping of the Firestore
/// protocol used on the streams.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        self.database_id.database_name()
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.database_id.document_name(key)
    }

    pub fn resource_name(&self, path: &ResourcePath) -> String {
        self.database_id.resource_name(path)
    }

    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        DocumentKey::from_path(self.database_id.path_from_name(name)?)
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        encode_value(value)
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        decode_value(value)
    }

    pub fn decode_map_value(&self, value: &JsonValue) -> FirestoreResult<MapValue> {
        decode_map_value(value)
    }

    /// A `Document` message: a found document at its update time.
    pub fn decode_document(&self, document: &JsonValue) -> FirestoreResult<MutableDocument> {
        let name = document
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document missing name"))?;
        let key = self.document_key_from_name(name)?;
        let fields = decode_map_value(document)?;
        let version = self.decode_optional_version(document.get("updateTime"))?;
        let create_time = self.decode_optional_version(document.get("createTime"))?;
        Ok(
            MutableDocument::new_found_document(key, version, ObjectValue::new(fields))
                .set_create_time(create_time),
        )
    }

    pub fn encode_document(&self, key: &DocumentKey, data: &ObjectValue) -> JsonValue {
        json!({
            "name": self.document_name(key),
            "fields": encode_map_fields(data.map()),
        })
    }

    pub fn encode_timestamp(&self, timestamp: &Timestamp) -> String {
        encode_timestamp(timestamp)
    }

    pub fn decode_timestamp_string(&self, value: &str) -> FirestoreResult<Timestamp> {
        parse_timestamp(value)
    }

    pub fn encode_version(&self, version: SnapshotVersion) -> String {
        encode_timestamp(&version.timestamp())
    }

    pub fn decode_version(&self, value: &JsonValue) -> FirestoreResult<SnapshotVersion> {
        let text = value
            .as_str()
            .ok_or_else(|| invalid_argument("Expected timestamp string"))?;
        Ok(SnapshotVersion::new(parse_timestamp(text)?))
    }

    /// Absent timestamps decode as the minimum version.
    pub fn decode_optional_version(&self, value: Option<&JsonValue>) -> FirestoreResult<SnapshotVersion> {
        match value {
            Some(value) if !value.is_null() => self.decode_version(value),
            _ => Ok(SnapshotVersion::min()),
        }
    }

    pub fn encode_bytes(&self, bytes: &[u8]) -> String {
        BASE64_STANDARD.encode(bytes)
    }

    pub fn decode_bytes(&self, value: &str) -> FirestoreResult<Vec<u8>> {
        BASE64_STANDARD
            .decode(value)
            .map_err(|err| invalid_argument(format!("Invalid base64 payload: {err}")))
    }

    /// The `addTarget` payload of a listen request.
    pub fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let mut target = serde_json::Map::new();
        if target_data.target.is_document_target() {
            let name = self.resource_name(&target_data.target.path);
            target.insert("documents".to_string(), json!({ "documents": [name] }));
        } else {
            target.insert(
                "query".to_string(),
                encode_query_target(self, &target_data.target),
            );
        }
        target.insert("targetId".to_string(), json!(target_data.target_id));

        let resumes = if !target_data.resume_token.is_empty() {
            target.insert(
                "resumeToken".to_string(),
                json!(self.encode_bytes(&target_data.resume_token)),
            );
            true
        } else if target_data.snapshot_version > SnapshotVersion::min() {
            target.insert(
                "readTime".to_string(),
                json!(self.encode_version(target_data.snapshot_version)),
            );
            true
        } else {
            false
        };
        if resumes {
            if let Some(count) = target_data.expected_count {
                target.insert("expectedCount".to_string(), json!(count));
            }
        }

        JsonValue::Object(target)
    }

    pub fn encode_listen_request(&self, target_data: &TargetData) -> JsonValue {
        let mut request = json!({
            "database": self.database_name(),
            "addTarget": self.encode_target(target_data),
        });
        if let Some(tag) = target_data.purpose.goog_listen_tag() {
            request["labels"] = json!({ "goog-listen-tags": tag });
        }
        request
    }

    pub fn encode_unlisten_request(&self, target_id: i32) -> JsonValue {
        json!({
            "database": self.database_name(),
            "removeTarget": target_id,
        })
    }

    /// First message on a write stream; the response carries the stream token.
    pub fn encode_handshake(&self) -> JsonValue {
        json!({ "database": self.database_name() })
    }

    pub fn encode_write_request(&self, stream_token: &[u8], mutations: &[Mutation]) -> JsonValue {
        json!({
            "streamToken": self.encode_bytes(stream_token),
            "writes": mutations.iter().map(|mutation| self.encode_mutation(mutation)).collect::<Vec<_>>(),
        })
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = serde_json::Map::new();
        match mutation {
            Mutation::Set { key, value, .. } => {
                write.insert("update".to_string(), self.encode_document(key, value));
            }
            Mutation::Patch { key, data, mask, .. } => {
                write.insert("update".to_string(), self.encode_document(key, data));
                let paths: Vec<String> = mask.iter().map(|path| path.canonical_string()).collect();
                write.insert("updateMask".to_string(), json!({ "fieldPaths": paths }));
            }
            Mutation::Delete { key, .. } => {
                write.insert("delete".to_string(), json!(self.document_name(key)));
            }
            Mutation::Verify { key, .. } => {
                write.insert("verify".to_string(), json!(self.document_name(key)));
            }
        }

        let transforms = mutation.field_transforms();
        if !transforms.is_empty() {
            write.insert(
                "updateTransforms".to_string(),
                JsonValue::Array(transforms.iter().map(|t| self.encode_field_transform(t)).collect()),
            );
        }

        match mutation.precondition() {
            Precondition::None => {}
            Precondition::Exists(exists) => {
                write.insert("currentDocument".to_string(), json!({ "exists": exists }));
            }
            Precondition::UpdateTime(version) => {
                write.insert(
                    "currentDocument".to_string(),
                    json!({ "updateTime": self.encode_version(*version) }),
                );
            }
        }

        JsonValue::Object(write)
    }

    fn encode_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field_path.canonical_string();
        match &transform.operation {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME"
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": {
                    "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                }
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": {
                    "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                }
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": encode_value(operand)
            }),
        }
    }

    /// Decodes a write stream response. Results without an update time were
    /// no-ops and take the commit version.
    pub fn decode_write_response(&self, value: &JsonValue) -> FirestoreResult<WriteResponse> {
        let stream_token = match value.get("streamToken").and_then(JsonValue::as_str) {
            Some(token) => self.decode_bytes(token)?,
            None => Vec::new(),
        };
        let commit_version = self.decode_optional_version(value.get("commitTime"))?;

        let mut mutation_results = Vec::new();
        if let Some(results) = value.get("writeResults").and_then(JsonValue::as_array) {
            for result in results {
                let version = match result.get("updateTime") {
                    Some(update_time) => self.decode_version(update_time)?,
                    None => commit_version,
                };
                let transform_results = match result.get("transformResults").and_then(JsonValue::as_array) {
                    Some(values) => values
                        .iter()
                        .map(decode_value)
                        .collect::<FirestoreResult<Vec<_>>>()?,
                    None => Vec::new(),
                };
                mutation_results.push(MutationResult::new(version, transform_results));
            }
        }

        Ok(WriteResponse {
            stream_token,
            commit_version,
            mutation_results,
        })
    }
}

fn encode_map_fields(map: &MapValue) -> JsonValue {
    let mut fields = serde_json::Map::new();
    for (key, value) in map.fields() {
        fields.insert(key.clone(), encode_value(value));
    }
    JsonValue::Object(fields)
}

fn encode_value(value: &FirestoreValue) -> JsonValue {
    match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) => encode_double(*double),
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": encode_timestamp(timestamp) }),
        ValueKind::ServerTimestamp(pending) => json!({
            "mapValue": {
                "fields": {
                    "__type__": { "stringValue": SERVER_TIMESTAMP_TYPE },
                    "__local_write_time__": { "timestampValue": encode_timestamp(&pending.local_write_time) }
                }
            }
        }),
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::GeoPoint(point) => json!({
            "geoPointValue": {
                "latitude": point.latitude(),
                "longitude": point.longitude(),
            }
        }),
        ValueKind::Array(array) => {
            let values = array.values().iter().map(encode_value).collect::<Vec<_>>();
            json!({ "arrayValue": { "values": values } })
        }
        ValueKind::Vector(values) => json!({
            "mapValue": {
                "fields": {
                    "__type__": { "stringValue": VECTOR_TYPE },
                    "value": {
                        "arrayValue": {
                            "values": values.iter().map(|v| encode_double(*v)).collect::<Vec<_>>()
                        }
                    }
                }
            }
        }),
        ValueKind::Map(map) => json!({
            "mapValue": {
                "fields": encode_map_fields(map)
            }
        }),
    }
}

/// JSON has no literal for non-finite numbers; the proto JSON mapping uses
/// strings for them.
fn encode_double(value: f64) -> JsonValue {
    if value.is_nan() {
        json!({ "doubleValue": "NaN" })
    } else if value.is_infinite() {
        json!({ "doubleValue": if value > 0.0 { "Infinity" } else { "-Infinity" } })
    } else {
        json!({ "doubleValue": value })
    }
}

fn decode_map_value(value: &JsonValue) -> FirestoreResult<MapValue> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected object for map value"))?;
    let fields_object = match map.get("fields") {
        Some(fields_value) => fields_value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?,
        None => return Ok(MapValue::new(BTreeMap::new())),
    };

    let mut fields = BTreeMap::new();
    for (key, value) in fields_object {
        fields.insert(key.clone(), decode_value(value)?);
    }
    Ok(MapValue::new(fields))
}

fn decode_value(value: &JsonValue) -> FirestoreResult<FirestoreValue> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
    if object.contains_key("nullValue") {
        return Ok(FirestoreValue::null());
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(FirestoreValue::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = match integer_value {
            JsonValue::String(value) => i64::from_str(value)
                .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(FirestoreValue::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        return Ok(FirestoreValue::from_double(decode_double(double_value)?));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let timestamp_str = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(FirestoreValue::from_timestamp(parse_timestamp(timestamp_str)?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let str_value = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(str_value));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let str_value = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        let decoded = BytesValue::from_base64(str_value)
            .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
        return Ok(FirestoreValue::from_bytes(decoded));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let str_value = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(FirestoreValue::from_reference(str_value));
    }
    if let Some(geo_point) = object.get("geoPointValue") {
        let latitude = geo_point
            .get("latitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or_default();
        let longitude = geo_point
            .get("longitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or_default();
        return Ok(FirestoreValue::from_geo_point(GeoPoint::new(latitude, longitude)?));
    }
    if let Some(array_value) = object.get("arrayValue") {
        let decoded = match array_value.get("values").and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(decode_value)
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        return Ok(FirestoreValue::from_array(decoded));
    }
    if let Some(map_value) = object.get("mapValue") {
        let map = decode_map_value(map_value)?;
        if let Some(vector) = vector_from_map(&map) {
            return Ok(FirestoreValue::from_vector(vector));
        }
        return Ok(FirestoreValue::from_map(map.into_fields()));
    }

    Err(invalid_argument("Unknown Firestore value type"))
}

fn decode_double(value: &JsonValue) -> FirestoreResult<f64> {
    match value {
        JsonValue::Number(number) => number
            .as_f64()
            .ok_or_else(|| invalid_argument("Invalid doubleValue")),
        JsonValue::String(text) => match text.as_str() {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            other => other
                .parse::<f64>()
                .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}"))),
        },
        _ => Err(invalid_argument("doubleValue must be a number or string")),
    }
}

fn vector_from_map(map: &MapValue) -> Option<Vec<f64>> {
    let fields = map.fields();
    match fields.get("__type__").map(FirestoreValue::kind) {
        Some(ValueKind::String(kind)) if kind == VECTOR_TYPE => {}
        _ => return None,
    }
    let array = fields.get("value")?.as_array()?;
    array
        .values()
        .iter()
        .map(|value| match value.kind() {
            ValueKind::Double(double) => Some(*double),
            ValueKind::Integer(integer) => Some(*integer as f64),
            _ => None,
        })
        .collect()
}

fn encode_timestamp(timestamp: &Timestamp) -> String {
    match Utc.timestamp_opt(timestamp.seconds, timestamp.nanos as u32).single() {
        Some(datetime) => datetime.to_rfc3339_opts(SecondsFormat::Nanos, true),
        None => {
            log::warn!("serializer: timestamp {timestamp} is out of range, encoding the epoch");
            DateTime::<Utc>::default().to_rfc3339_opts(SecondsFormat::Nanos, true)
        }
    }
}

fn parse_timestamp(value: &str) -> FirestoreResult<Timestamp> {
    let datetime = DateTime::parse_from_rfc3339(value)
        .map_err(|err| invalid_argument(format!("Invalid timestamp: {err}")))?;
    let datetime_utc = datetime.with_timezone(&Utc);
    Timestamp::checked(
        datetime_utc.timestamp(),
        datetime_utc.timestamp_subsec_nanos() as i32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::local::TargetPurpose;
    use crate::firestore::model::{FieldMask, FieldPath};

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::default_for("project"))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn decodes_documents_with_nested_values() {
        let document = json!({
            "name": "projects/project/databases/(default)/documents/rooms/eros",
            "updateTime": "2024-01-02T03:04:05.000000006Z",
            "fields": {
                "name": { "stringValue": "Ada" },
                "age": { "integerValue": "42" },
                "nested": { "mapValue": { "fields": { "flag": { "booleanValue": true } } } },
                "embedding": { "mapValue": { "fields": {
                    "__type__": { "stringValue": "__vector__" },
                    "value": { "arrayValue": { "values": [{ "doubleValue": 1.5 }] } }
                } } }
            }
        });

        let decoded = serializer().decode_document(&document).unwrap();
        assert_eq!(decoded.key(), &key("rooms/eros"));
        assert_eq!(decoded.version().timestamp(), Timestamp::new(1_704_164_645, 6));
        assert_eq!(
            decoded.field(&FieldPath::from_dot_separated("nested.flag").unwrap()),
            Some(&FirestoreValue::from_bool(true))
        );
        assert_eq!(
            decoded.field(&FieldPath::from_dot_separated("embedding").unwrap()),
            Some(&FirestoreValue::from_vector(vec![1.5]))
        );
    }

    #[test]
    fn encodes_patch_with_mask_and_precondition() {
        let mut data = ObjectValue::empty();
        let field = FieldPath::from_dot_separated("a.b").unwrap();
        data.set(&field, FirestoreValue::from_integer(1));
        let mutation = Mutation::patch(key("docs/1"), data, FieldMask::new([field]))
            .with_precondition(Precondition::Exists(true));

        let encoded = serializer().encode_mutation(&mutation);
        assert_eq!(
            encoded["update"]["name"],
            json!("projects/project/databases/(default)/documents/docs/1")
        );
        assert_eq!(encoded["updateMask"]["fieldPaths"], json!(["a.b"]));
        assert_eq!(encoded["currentDocument"]["exists"], json!(true));
    }

    #[test]
    fn listen_request_resumes_with_token_and_expected_count() {
        let target = Query::collection(ResourcePath::from_string("rooms").unwrap()).to_target();
        let data = TargetData::new(target, 2, TargetPurpose::ExistenceFilterMismatch, 1)
            .with_resume_token(vec![9, 9], SnapshotVersion::from_micros(5))
            .with_expected_count(Some(3));

        let request = serializer().encode_listen_request(&data);
        assert_eq!(request["addTarget"]["targetId"], json!(2));
        assert_eq!(request["addTarget"]["resumeToken"], json!("CQk="));
        assert_eq!(request["addTarget"]["expectedCount"], json!(3));
        assert_eq!(
            request["labels"]["goog-listen-tags"],
            json!("existence-filter-mismatch")
        );
    }

    #[test]
    fn write_results_without_update_time_use_commit_time() {
        let response = json!({
            "streamToken": "AQI=",
            "commitTime": "2024-01-01T00:00:10Z",
            "writeResults": [
                { "updateTime": "2024-01-01T00:00:05Z" },
                { "transformResults": [{ "integerValue": "3" }] }
            ]
        });
        let decoded = serializer().decode_write_response(&response).unwrap();
        assert_eq!(decoded.stream_token, vec![1, 2]);
        assert_eq!(decoded.mutation_results.len(), 2);
        assert_eq!(
            decoded.mutation_results[1].version,
            decoded.commit_version
        );
        assert_eq!(
            decoded.mutation_results[1].transform_results,
            vec![FirestoreValue::from_integer(3)]
        );
    }
}
