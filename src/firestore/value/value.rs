use std::collections::BTreeMap;

use crate::firestore::model::{GeoPoint, Timestamp};
use crate::firestore::value::{values, ArrayValue, BytesValue, MapValue};

/// Tagged document field value.
///
/// Equality follows the backend: integers and doubles never compare equal,
/// `NaN` equals `NaN` and `-0.0` differs from `0.0`. Use
/// [`values::compare`] for the total ordering used by queries.
#[derive(Clone, Debug)]
pub struct FirestoreValue {
    kind: ValueKind,
}

/// Local placeholder for a pending server timestamp transform.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerTimestampValue {
    pub local_write_time: Timestamp,
    pub previous_value: Option<Box<FirestoreValue>>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    ServerTimestamp(ServerTimestampValue),
    String(String),
    Bytes(BytesValue),
    /// Fully qualified resource name of the referenced document.
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Vector(Vec<f64>),
    Map(MapValue),
}

/// Rank of each value type in the cross-type ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypeOrder {
    Null = 0,
    Boolean = 1,
    Number = 2,
    Timestamp = 3,
    ServerTimestamp = 4,
    String = 5,
    Bytes = 6,
    Reference = 7,
    GeoPoint = 8,
    Array = 9,
    Vector = 10,
    Map = 11,
}

impl FirestoreValue {
    pub fn from_kind(kind: ValueKind) -> Self {
        Self { kind }
    }

    pub fn null() -> Self {
        Self::from_kind(ValueKind::Null)
    }

    pub fn from_bool(value: bool) -> Self {
        Self::from_kind(ValueKind::Boolean(value))
    }

    pub fn from_integer(value: i64) -> Self {
        Self::from_kind(ValueKind::Integer(value))
    }

    pub fn from_double(value: f64) -> Self {
        Self::from_kind(ValueKind::Double(value))
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self::from_kind(ValueKind::Timestamp(value))
    }

    pub fn server_timestamp(local_write_time: Timestamp, previous: Option<FirestoreValue>) -> Self {
        // Nested placeholders keep only the oldest known value.
        let previous_value = previous.map(|value| match value.kind {
            ValueKind::ServerTimestamp(inner) => inner.previous_value,
            _ => Some(Box::new(value)),
        });
        Self::from_kind(ValueKind::ServerTimestamp(ServerTimestampValue {
            local_write_time,
            previous_value: previous_value.flatten(),
        }))
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self::from_kind(ValueKind::String(value.into()))
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self::from_kind(ValueKind::Bytes(value))
    }

    pub fn from_reference(name: impl Into<String>) -> Self {
        Self::from_kind(ValueKind::Reference(name.into()))
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self::from_kind(ValueKind::GeoPoint(value))
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self::from_kind(ValueKind::Array(ArrayValue::new(values)))
    }

    pub fn from_vector(values: Vec<f64>) -> Self {
        Self::from_kind(ValueKind::Vector(values))
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self::from_kind(ValueKind::Map(MapValue::new(map)))
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn into_kind(self) -> ValueKind {
        self.kind
    }

    pub fn type_order(&self) -> TypeOrder {
        match &self.kind {
            ValueKind::Null => TypeOrder::Null,
            ValueKind::Boolean(_) => TypeOrder::Boolean,
            ValueKind::Integer(_) | ValueKind::Double(_) => TypeOrder::Number,
            ValueKind::Timestamp(_) => TypeOrder::Timestamp,
            ValueKind::ServerTimestamp(_) => TypeOrder::ServerTimestamp,
            ValueKind::String(_) => TypeOrder::String,
            ValueKind::Bytes(_) => TypeOrder::Bytes,
            ValueKind::Reference(_) => TypeOrder::Reference,
            ValueKind::GeoPoint(_) => TypeOrder::GeoPoint,
            ValueKind::Array(_) => TypeOrder::Array,
            ValueKind::Vector(_) => TypeOrder::Vector,
            ValueKind::Map(_) => TypeOrder::Map,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, ValueKind::Array(_))
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match &self.kind {
            ValueKind::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }
}

impl PartialEq for FirestoreValue {
    fn eq(&self, other: &Self) -> bool {
        values::equals(self, other)
    }
}

impl Eq for FirestoreValue {}

impl From<bool> for FirestoreValue {
    fn from(value: bool) -> Self {
        Self::from_bool(value)
    }
}

impl From<i64> for FirestoreValue {
    fn from(value: i64) -> Self {
        Self::from_integer(value)
    }
}

impl From<f64> for FirestoreValue {
    fn from(value: f64) -> Self {
        Self::from_double(value)
    }
}

impl From<&str> for FirestoreValue {
    fn from(value: &str) -> Self {
        Self::from_string(value)
    }
}

impl From<String> for FirestoreValue {
    fn from(value: String) -> Self {
        Self::from_string(value)
    }
}
