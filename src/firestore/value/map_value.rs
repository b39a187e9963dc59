use std::collections::BTreeMap;

use crate::firestore::model::FieldPath;
use crate::firestore::value::{FirestoreValue, ValueKind};

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Resolves a nested field. Intermediate non-map values end the lookup.
    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            match current.kind() {
                ValueKind::Map(child) => current = child.fields.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_nested_fields() {
        let mut inner = BTreeMap::new();
        inner.insert("leaf".to_string(), FirestoreValue::from_integer(1));
        let mut outer = BTreeMap::new();
        outer.insert("inner".to_string(), FirestoreValue::from_map(inner));
        outer.insert("scalar".to_string(), FirestoreValue::from_bool(true));
        let map = MapValue::new(outer);

        let leaf = FieldPath::from_dot_separated("inner.leaf").unwrap();
        assert_eq!(map.get(&leaf), Some(&FirestoreValue::from_integer(1)));
        let through_scalar = FieldPath::from_dot_separated("scalar.leaf").unwrap();
        assert!(map.get(&through_scalar).is_none());
    }
}
