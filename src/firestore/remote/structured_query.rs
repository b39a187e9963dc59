use serde_json::{json, Value as JsonValue};

use crate::firestore::core::{Bound, Filter, Operator, OrderBy, Target};
use crate::firestore::model::{FieldPath, ResourcePath};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::value::{FirestoreValue, ValueKind};

/// `query` body of an `addTarget` request: the parent resource name plus the
/// structured query.
pub(crate) fn encode_query_target(serializer: &JsonProtoSerializer, target: &Target) -> JsonValue {
    let (parent, collection_id, all_descendants) = match &target.collection_group {
        Some(group) => (target.path.clone(), group.clone(), true),
        None => (
            target.path.without_last(),
            target.path.last_segment().unwrap_or_default().to_string(),
            false,
        ),
    };

    json!({
        "parent": serializer.resource_name(&parent),
        "structuredQuery": encode_structured_query(serializer, target, collection_id, all_descendants),
    })
}

fn encode_structured_query(
    serializer: &JsonProtoSerializer,
    target: &Target,
    collection_id: String,
    all_descendants: bool,
) -> JsonValue {
    let mut structured = serde_json::Map::new();

    let mut from_entry = serde_json::Map::new();
    from_entry.insert("collectionId".to_string(), json!(collection_id));
    if all_descendants {
        from_entry.insert("allDescendants".to_string(), json!(true));
    }
    structured.insert(
        "from".to_string(),
        JsonValue::Array(vec![JsonValue::Object(from_entry)]),
    );

    if let Some(filter) = encode_filters(serializer, &target.filters) {
        structured.insert("where".to_string(), filter);
    }

    if !target.order_bys.is_empty() {
        let orders: Vec<_> = target
            .order_bys
            .iter()
            .map(|order| {
                json!({
                    "field": { "fieldPath": order.field.canonical_string() },
                    "direction": order.direction.as_str(),
                })
            })
            .collect();
        structured.insert("orderBy".to_string(), JsonValue::Array(orders));
    }

    if let Some(limit) = target.limit {
        structured.insert("limit".to_string(), json!(limit));
    }

    if let Some(start) = &target.start_at {
        structured.insert(
            "startAt".to_string(),
            encode_cursor(serializer, &target.order_bys, start, true),
        );
    }

    if let Some(end) = &target.end_at {
        structured.insert(
            "endAt".to_string(),
            encode_cursor(serializer, &target.order_bys, end, false),
        );
    }

    JsonValue::Object(structured)
}

fn encode_filters(serializer: &JsonProtoSerializer, filters: &[Filter]) -> Option<JsonValue> {
    match filters {
        [] => None,
        [single] => Some(encode_filter(serializer, single)),
        many => Some(json!({
            "compositeFilter": {
                "op": "AND",
                "filters": many.iter().map(|filter| encode_filter(serializer, filter)).collect::<Vec<_>>()
            }
        })),
    }
}

fn encode_filter(serializer: &JsonProtoSerializer, filter: &Filter) -> JsonValue {
    match filter {
        Filter::Field(field_filter) => {
            if let Some(unary) = unary_operator(field_filter.op, &field_filter.value) {
                return json!({
                    "unaryFilter": {
                        "field": { "fieldPath": field_filter.field.canonical_string() },
                        "op": unary,
                    }
                });
            }
            json!({
                "fieldFilter": {
                    "field": { "fieldPath": field_filter.field.canonical_string() },
                    "op": field_filter.op.as_str(),
                    "value": encode_field_value(serializer, &field_filter.field, &field_filter.value),
                }
            })
        }
        Filter::Composite { op, filters } => json!({
            "compositeFilter": {
                "op": op.as_str(),
                "filters": filters.iter().map(|filter| encode_filter(serializer, filter)).collect::<Vec<_>>()
            }
        }),
    }
}

fn unary_operator(op: Operator, value: &FirestoreValue) -> Option<&'static str> {
    let is_nan = value.is_nan();
    let is_null = value.is_null();
    match op {
        Operator::Equal if is_nan => Some("IS_NAN"),
        Operator::Equal if is_null => Some("IS_NULL"),
        Operator::NotEqual if is_nan => Some("IS_NOT_NAN"),
        Operator::NotEqual if is_null => Some("IS_NOT_NULL"),
        _ => None,
    }
}

/// Key comparisons travel as fully qualified reference names.
fn encode_field_value(
    serializer: &JsonProtoSerializer,
    field: &FieldPath,
    value: &FirestoreValue,
) -> JsonValue {
    if !field.is_document_id() {
        return serializer.encode_value(value);
    }
    match value.kind() {
        ValueKind::Reference(name) if !name.starts_with("projects/") => {
            let path = ResourcePath::from_string(name).unwrap_or_else(|_| ResourcePath::root());
            json!({ "referenceValue": serializer.resource_name(&path) })
        }
        ValueKind::Array(array) => json!({
            "arrayValue": {
                "values": array
                    .values()
                    .iter()
                    .map(|element| encode_field_value(serializer, field, element))
                    .collect::<Vec<_>>()
            }
        }),
        _ => serializer.encode_value(value),
    }
}

fn encode_cursor(
    serializer: &JsonProtoSerializer,
    order_bys: &[OrderBy],
    bound: &Bound,
    start: bool,
) -> JsonValue {
    let values: Vec<_> = bound
        .position
        .iter()
        .enumerate()
        .map(|(index, value)| match order_bys.get(index) {
            Some(order) => encode_field_value(serializer, &order.field, value),
            None => serializer.encode_value(value),
        })
        .collect();
    json!({
        "values": values,
        "before": if start { bound.inclusive } else { !bound.inclusive },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::model::DatabaseId;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::default_for("p"))
    }

    #[test]
    fn encodes_collection_query_with_filters_and_limit() {
        let query = Query::collection(ResourcePath::from_string("rooms/eros/messages").unwrap())
            .with_filter(Filter::field(
                FieldPath::from_dot_separated("sender").unwrap(),
                Operator::Equal,
                FirestoreValue::from_string("ada"),
            ))
            .with_filter(Filter::field(
                FieldPath::from_dot_separated("deleted").unwrap(),
                Operator::Equal,
                FirestoreValue::null(),
            ))
            .limit_to_first(3);

        let encoded = encode_query_target(&serializer(), &query.to_target());
        assert_eq!(
            encoded["parent"],
            json!("projects/p/databases/(default)/documents/rooms/eros")
        );
        let structured = &encoded["structuredQuery"];
        assert_eq!(structured["from"][0]["collectionId"], json!("messages"));
        assert_eq!(structured["limit"], json!(3));
        let filters = &structured["where"]["compositeFilter"]["filters"];
        assert_eq!(filters[0]["fieldFilter"]["op"], json!("EQUAL"));
        assert_eq!(filters[1]["unaryFilter"]["op"], json!("IS_NULL"));
    }

    #[test]
    fn encodes_collection_group_parent() {
        let query = Query::collection_group("messages".to_string());
        let encoded = encode_query_target(&serializer(), &query.to_target());
        assert_eq!(
            encoded["parent"],
            json!("projects/p/databases/(default)/documents")
        );
        assert_eq!(
            encoded["structuredQuery"]["from"][0]["allDescendants"],
            json!(true)
        );
    }
}
