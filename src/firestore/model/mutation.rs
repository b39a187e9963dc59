use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::model::{DocumentKey, FieldMask, FieldPath, MutableDocument, SnapshotVersion, Timestamp};
use crate::firestore::value::{FirestoreValue, ObjectValue, ValueKind};

/// Condition a document must satisfy for a mutation to apply.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    /// Operand is an integer or double value.
    NumericIncrement(FirestoreValue),
}

impl TransformOperation {
    pub fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => {
                FirestoreValue::server_timestamp(local_write_time, previous.cloned())
            }
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::NumericIncrement(operand) => {
                let base = self
                    .compute_base_value(previous)
                    .unwrap_or_else(|| FirestoreValue::from_integer(0));
                numeric_increment(&base, operand)
            }
        }
    }

    /// Server results replace the local value for non-idempotent transforms.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        transform_result: Option<&FirestoreValue>,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::ServerTimestamp | TransformOperation::NumericIncrement(_) => {
                transform_result.cloned().unwrap_or_else(FirestoreValue::null)
            }
        }
    }

    /// Base value an increment starts from: the current number, or zero when
    /// the field holds anything else.
    pub fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => Some(match previous {
                Some(value) if value.is_number() => value.clone(),
                _ => FirestoreValue::from_integer(0),
            }),
            _ => None,
        }
    }

    pub fn is_idempotent(&self) -> bool {
        !matches!(self, TransformOperation::NumericIncrement(_))
    }
}

fn existing_array(previous: Option<&FirestoreValue>) -> Vec<FirestoreValue> {
    previous
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default()
}

fn array_union(previous: Option<&FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = existing_array(previous);
    for element in additions {
        if !values.iter().any(|candidate| candidate == element) {
            values.push(element.clone());
        }
    }
    FirestoreValue::from_array(values)
}

fn array_remove(previous: Option<&FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let values = existing_array(previous)
        .into_iter()
        .filter(|candidate| !removals.iter().any(|needle| needle == candidate))
        .collect();
    FirestoreValue::from_array(values)
}

fn numeric_increment(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(current), ValueKind::Integer(delta)) => match current.checked_add(*delta) {
            Some(sum) => FirestoreValue::from_integer(sum),
            None => FirestoreValue::from_double(*current as f64 + *delta as f64),
        },
        (ValueKind::Integer(current), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(*current as f64 + delta)
        }
        (ValueKind::Double(current), ValueKind::Integer(delta)) => {
            FirestoreValue::from_double(current + *delta as f64)
        }
        (ValueKind::Double(current), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(current + delta)
        }
        _ => operand.clone(),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    pub field_path: FieldPath,
    pub operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field_path: FieldPath, operation: TransformOperation) -> Self {
        Self {
            field_path,
            operation,
        }
    }
}

/// Result of applying a single mutation on the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Vec<FirestoreValue>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Set {
        key: DocumentKey,
        value: ObjectValue,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    Patch {
        key: DocumentKey,
        data: ObjectValue,
        mask: FieldMask,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    /// Only used by transactions to assert a read version.
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: ObjectValue) -> Self {
        Mutation::Set {
            key,
            value,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    /// Patch that requires the document to exist, like an `update` call.
    pub fn patch(key: DocumentKey, data: ObjectValue, mask: FieldMask) -> Self {
        Mutation::Patch {
            key,
            data,
            mask,
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Mutation::Verify { key, precondition }
    }

    pub fn with_precondition(mut self, new_precondition: Precondition) -> Self {
        match &mut self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => *precondition = new_precondition,
        }
        self
    }

    pub fn with_transforms(mut self, transforms: Vec<FieldTransform>) -> Self {
        if let Mutation::Set {
            field_transforms, ..
        }
        | Mutation::Patch {
            field_transforms, ..
        } = &mut self
        {
            *field_transforms = transforms;
        }
        self
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> &Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => precondition,
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Set {
                field_transforms, ..
            }
            | Mutation::Patch {
                field_transforms, ..
            } => field_transforms,
            Mutation::Delete { .. } | Mutation::Verify { .. } => &[],
        }
    }

    /// Fields this mutation may change, `None` when it replaces the whole
    /// document.
    pub fn field_mask(&self) -> Option<FieldMask> {
        match self {
            Mutation::Patch {
                mask,
                field_transforms,
                ..
            } => {
                let mut mask = mask.clone();
                for transform in field_transforms {
                    mask.insert(transform.field_path.clone());
                }
                Some(mask)
            }
            Mutation::Verify { .. } => Some(FieldMask::empty()),
            Mutation::Set { .. } | Mutation::Delete { .. } => None,
        }
    }

    /// Applies the mutation to the local view of `document`. A failed
    /// precondition leaves the document untouched. Returns the updated
    /// document and the accumulated mask of changed fields (`None` means the
    /// whole document changed).
    pub fn apply_to_local_view(
        &self,
        document: MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> (MutableDocument, Option<FieldMask>) {
        if !self.precondition().is_valid_for(&document) {
            return (document, previous_mask);
        }
        match self {
            Mutation::Set {
                value,
                field_transforms,
                ..
            } => {
                let transform_results =
                    local_transform_results(field_transforms, &document, local_write_time);
                let mut data = value.clone();
                data.set_all(transform_results);
                let version = document.version();
                let document = document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
                (document, None)
            }
            Mutation::Patch {
                data,
                mask,
                field_transforms,
                ..
            } => {
                let transform_results =
                    local_transform_results(field_transforms, &document, local_write_time);
                let mut edits = patch_edits(data, mask);
                edits.extend(transform_results);
                let mut merged = document.data().clone();
                merged.set_all(edits);
                let version = document.version();
                let document = document
                    .convert_to_found_document(version, merged)
                    .set_has_local_mutations();
                let accumulated = previous_mask.map(|previous| {
                    let mut combined = previous.union(mask);
                    for transform in field_transforms {
                        combined.insert(transform.field_path.clone());
                    }
                    combined
                });
                (document, accumulated)
            }
            Mutation::Delete { .. } => {
                let version = document.version();
                let document = document
                    .convert_to_no_document(version)
                    .set_has_local_mutations();
                (document, None)
            }
            Mutation::Verify { .. } => (document, previous_mask),
        }
    }

    /// Applies the backend's acknowledgement of this mutation to `document`.
    pub fn apply_to_remote_document(
        &self,
        document: MutableDocument,
        result: &MutationResult,
    ) -> MutableDocument {
        match self {
            Mutation::Set {
                value,
                field_transforms,
                ..
            } => {
                let transform_results =
                    server_transform_results(field_transforms, &document, &result.transform_results);
                let mut data = value.clone();
                data.set_all(transform_results);
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations()
            }
            Mutation::Patch {
                data,
                mask,
                field_transforms,
                precondition,
                ..
            } => {
                if !precondition.is_valid_for(&document) {
                    // The backend applied the patch against a document we never saw.
                    return document.convert_to_unknown_document(result.version);
                }
                let transform_results =
                    server_transform_results(field_transforms, &document, &result.transform_results);
                let mut edits = patch_edits(data, mask);
                edits.extend(transform_results);
                let mut merged = document.data().clone();
                merged.set_all(edits);
                document
                    .convert_to_found_document(result.version, merged)
                    .set_has_committed_mutations()
            }
            Mutation::Delete { .. } => document
                .convert_to_no_document(result.version)
                .set_has_committed_mutations(),
            Mutation::Verify { .. } => {
                log::warn!("mutation: verify mutations are never acknowledged outside transactions");
                document
            }
        }
    }

    /// Base values for non-idempotent transforms, captured when the mutation
    /// is queued so that the local view stays stable across remote updates.
    pub fn extract_transform_base_value(&self, document: &MutableDocument) -> Option<ObjectValue> {
        let mut base = ObjectValue::empty();
        let mut found = false;
        for transform in self.field_transforms() {
            let existing = document.field(&transform.field_path);
            if let Some(value) = transform.operation.compute_base_value(existing) {
                base.set(&transform.field_path, value);
                found = true;
            }
        }
        found.then_some(base)
    }
}

fn patch_edits(data: &ObjectValue, mask: &FieldMask) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    mask.iter()
        .map(|path| (path.clone(), data.field(path).cloned()))
        .collect()
}

fn local_transform_results(
    transforms: &[FieldTransform],
    document: &MutableDocument,
    local_write_time: Timestamp,
) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    transforms
        .iter()
        .map(|transform| {
            let previous = document.field(&transform.field_path);
            let value = transform
                .operation
                .apply_to_local_view(previous, local_write_time);
            (transform.field_path.clone(), Some(value))
        })
        .collect()
}

fn server_transform_results(
    transforms: &[FieldTransform],
    document: &MutableDocument,
    results: &[FirestoreValue],
) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    transforms
        .iter()
        .enumerate()
        .map(|(index, transform)| {
            let previous = document.field(&transform.field_path);
            let value = transform
                .operation
                .apply_to_remote_document(previous, results.get(index));
            (transform.field_path.clone(), Some(value))
        })
        .collect()
}

/// Compresses the local effect of queued mutations on `document` into a
/// single mutation. `mask` is the accumulated mask from
/// [`Mutation::apply_to_local_view`]; `None` yields a set or delete.
pub fn calculate_overlay_mutation(
    document: &MutableDocument,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    if !document.has_local_mutations() {
        return None;
    }
    let Some(mask) = mask else {
        return Some(if document.is_no_document() {
            Mutation::delete(document.key().clone())
        } else {
            Mutation::set(document.key().clone(), document.data().clone())
        });
    };
    if mask.is_empty() {
        return None;
    }

    let mut patch = ObjectValue::empty();
    let mut paths = BTreeSet::new();
    for path in mask.iter() {
        if paths.contains(path) {
            continue;
        }
        let mut target = path.clone();
        let mut value = document.field(&target);
        // A nested field that no longer exists is written through its parent.
        if value.is_none() && target.len() > 1 {
            if let Some(parent) = target.parent() {
                target = parent;
                value = document.field(&target);
            }
        }
        match value {
            Some(value) => patch.set(&target, value.clone()),
            None => patch.delete(&target),
        }
        paths.insert(target);
    }

    Some(Mutation::Patch {
        key: document.key().clone(),
        data: patch,
        mask: FieldMask::new(paths),
        precondition: Precondition::None,
        field_transforms: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DocumentKey {
        DocumentKey::from_string("coll/doc").unwrap()
    }

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    fn object(entries: &[(&str, FirestoreValue)]) -> ObjectValue {
        let mut object = ObjectValue::empty();
        for (field, value) in entries {
            object.set(&path(field), value.clone());
        }
        object
    }

    fn found(entries: &[(&str, FirestoreValue)]) -> MutableDocument {
        MutableDocument::new_found_document(
            key(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            object(entries),
        )
    }

    #[test]
    fn patch_requires_existing_document() {
        let patch = Mutation::patch(
            key(),
            object(&[("a", FirestoreValue::from_integer(1))]),
            FieldMask::new([path("a")]),
        );
        let missing = MutableDocument::new_invalid_document(key());
        let (result, mask) = patch.apply_to_local_view(missing, Some(FieldMask::empty()), Timestamp::now());
        assert!(!result.is_valid_document());
        assert_eq!(mask, Some(FieldMask::empty()));
    }

    #[test]
    fn patch_merges_fields_and_accumulates_mask() {
        let patch = Mutation::patch(
            key(),
            object(&[("b", FirestoreValue::from_integer(2))]),
            FieldMask::new([path("b")]),
        );
        let (result, mask) = patch.apply_to_local_view(
            found(&[("a", FirestoreValue::from_integer(1))]),
            Some(FieldMask::empty()),
            Timestamp::now(),
        );
        assert_eq!(result.field(&path("a")), Some(&FirestoreValue::from_integer(1)));
        assert_eq!(result.field(&path("b")), Some(&FirestoreValue::from_integer(2)));
        assert!(result.has_local_mutations());
        assert_eq!(mask, Some(FieldMask::new([path("b")])));
    }

    #[test]
    fn increment_starts_from_zero_for_non_numbers() {
        let mutation = Mutation::patch(key(), ObjectValue::empty(), FieldMask::empty()).with_transforms(vec![
            FieldTransform::new(
                path("count"),
                TransformOperation::NumericIncrement(FirestoreValue::from_integer(5)),
            ),
        ]);
        let (result, _) = mutation.apply_to_local_view(
            found(&[("count", FirestoreValue::from_string("x"))]),
            None,
            Timestamp::now(),
        );
        assert_eq!(result.field(&path("count")), Some(&FirestoreValue::from_integer(5)));
    }

    #[test]
    fn increment_overflow_switches_to_double() {
        let result = numeric_increment(
            &FirestoreValue::from_integer(i64::MAX),
            &FirestoreValue::from_integer(1),
        );
        assert!(matches!(result.kind(), ValueKind::Double(_)));
    }

    #[test]
    fn array_transforms() {
        let existing = FirestoreValue::from_array(vec![FirestoreValue::from_integer(1), FirestoreValue::from_integer(2)]);
        let union = array_union(Some(&existing), &[FirestoreValue::from_integer(2), FirestoreValue::from_integer(3)]);
        assert_eq!(union, FirestoreValue::from_array(vec![FirestoreValue::from_integer(1), FirestoreValue::from_integer(2), FirestoreValue::from_integer(3)]));
        let removed = array_remove(Some(&existing), &[FirestoreValue::from_integer(1)]);
        assert_eq!(removed, FirestoreValue::from_array(vec![FirestoreValue::from_integer(2)]));
    }

    #[test]
    fn acknowledged_patch_on_missing_document_is_unknown() {
        let patch = Mutation::patch(
            key(),
            object(&[("a", FirestoreValue::from_integer(1))]),
            FieldMask::new([path("a")]),
        );
        let version = SnapshotVersion::new(Timestamp::new(7, 0));
        let result = patch.apply_to_remote_document(
            MutableDocument::new_no_document(key(), SnapshotVersion::min()),
            &MutationResult::new(version, Vec::new()),
        );
        assert!(result.is_unknown_document());
        assert_eq!(result.version(), version);
    }

    #[test]
    fn overlay_of_set_then_patch_is_a_set() {
        let write_time = Timestamp::now();
        let set = Mutation::set(key(), object(&[("a", FirestoreValue::from_integer(1))]));
        let patch = Mutation::patch(
            key(),
            object(&[("b", FirestoreValue::from_integer(2))]),
            FieldMask::new([path("b")]),
        );
        let document = MutableDocument::new_invalid_document(key());
        let (document, mask) = set.apply_to_local_view(document, Some(FieldMask::empty()), write_time);
        let (document, mask) = patch.apply_to_local_view(document, mask, write_time);
        let overlay = calculate_overlay_mutation(&document, mask.as_ref()).unwrap();
        match overlay {
            Mutation::Set { value, .. } => {
                assert_eq!(value, object(&[("a", FirestoreValue::from_integer(1)), ("b", FirestoreValue::from_integer(2))]));
            }
            other => panic!("unexpected overlay {other:?}"),
        }
    }
}
