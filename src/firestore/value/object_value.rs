use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::model::FieldPath;
use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

/// Document contents. Writes produce a modified copy of the owning document;
/// the value itself is edited through `set`/`delete` only while a mutation is
/// being applied.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ObjectValue {
    root: MapValue,
}

impl ObjectValue {
    pub fn new(root: MapValue) -> Self {
        Self { root }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self::new(MapValue::new(fields))
    }

    pub fn map(&self) -> &MapValue {
        &self.root
    }

    pub fn into_map(self) -> MapValue {
        self.root
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.root.get(path)
    }

    /// Sets `value` at `path`, replacing any non-map value found on the way.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        let mut fields = std::mem::take(&mut self.root).into_fields();
        set_at(&mut fields, path.segments(), value);
        self.root = MapValue::new(fields);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        let mut fields = std::mem::take(&mut self.root).into_fields();
        delete_at(&mut fields, path.segments());
        self.root = MapValue::new(fields);
    }

    /// Applies a batch of edits; `None` deletes the field.
    pub fn set_all(&mut self, edits: BTreeMap<FieldPath, Option<FirestoreValue>>) {
        for (path, value) in edits {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }

    /// Leaf paths of every non-map value, plus empty maps.
    pub fn field_mask(&self) -> BTreeSet<FieldPath> {
        let mut mask = BTreeSet::new();
        collect_leaves(&self.root, &[], &mut mask);
        mask
    }
}

fn set_at(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String], value: FirestoreValue) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }
    let mut child = match fields.remove(first).map(FirestoreValue::into_kind) {
        Some(ValueKind::Map(map)) => map.into_fields(),
        _ => BTreeMap::new(),
    };
    set_at(&mut child, rest, value);
    fields.insert(first.clone(), FirestoreValue::from_map(child));
}

fn delete_at(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.remove(first);
        return;
    }
    let is_map = matches!(fields.get(first).map(FirestoreValue::kind), Some(ValueKind::Map(_)));
    if !is_map {
        return;
    }
    if let Some(ValueKind::Map(map)) = fields.remove(first).map(FirestoreValue::into_kind) {
        let mut child = map.into_fields();
        delete_at(&mut child, rest);
        fields.insert(first.clone(), FirestoreValue::from_map(child));
    }
}

fn collect_leaves(map: &MapValue, prefix: &[String], mask: &mut BTreeSet<FieldPath>) {
    for (key, value) in map.fields() {
        let mut segments = prefix.to_vec();
        segments.push(key.clone());
        match value.kind() {
            ValueKind::Map(child) if !child.is_empty() => collect_leaves(child, &segments, mask),
            _ => {
                if let Ok(path) = FieldPath::new(segments) {
                    mask.insert(path);
                }
            }
        }
    }
}
