use std::cmp::Ordering;
use std::fmt::Write as _;

use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::firestore::value::{values, FirestoreValue, TypeOrder, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl Operator {
    /// Wire name used by structured queries.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::LessThan => "LESS_THAN",
            Operator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            Operator::Equal => "EQUAL",
            Operator::NotEqual => "NOT_EQUAL",
            Operator::GreaterThan => "GREATER_THAN",
            Operator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            Operator::ArrayContains => "ARRAY_CONTAINS",
            Operator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
            Operator::In => "IN",
            Operator::NotIn => "NOT_IN",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Some(match name {
            "LESS_THAN" => Operator::LessThan,
            "LESS_THAN_OR_EQUAL" => Operator::LessThanOrEqual,
            "EQUAL" => Operator::Equal,
            "NOT_EQUAL" => Operator::NotEqual,
            "GREATER_THAN" => Operator::GreaterThan,
            "GREATER_THAN_OR_EQUAL" => Operator::GreaterThanOrEqual,
            "ARRAY_CONTAINS" => Operator::ArrayContains,
            "ARRAY_CONTAINS_ANY" => Operator::ArrayContainsAny,
            "IN" => Operator::In,
            "NOT_IN" => Operator::NotIn,
            _ => return None,
        })
    }

    fn symbol(&self) -> &'static str {
        match self {
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqual => ">=",
            Operator::ArrayContains => "array-contains",
            Operator::ArrayContainsAny => "array-contains-any",
            Operator::In => "in",
            Operator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
                | Operator::NotEqual
                | Operator::NotIn
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    pub field: FieldPath,
    pub op: Operator,
    pub value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: Operator, value: FirestoreValue) -> Self {
        Self { field, op, value }
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        let key_value;
        let other = if self.field.is_document_id() {
            key_value = key_reference(document.key());
            Some(&key_value)
        } else {
            document.field(&self.field)
        };
        self.matches_value(other)
    }

    /// Evaluates the filter against a field value, `None` when the field is
    /// missing.
    pub fn matches_value(&self, other: Option<&FirestoreValue>) -> bool {
        match self.op {
            Operator::ArrayContains => other
                .and_then(FirestoreValue::as_array)
                .map_or(false, |array| values::array_contains(array.values(), &self.value)),
            Operator::ArrayContainsAny => {
                let (Some(array), Some(needles)) =
                    (other.and_then(FirestoreValue::as_array), self.value.as_array())
                else {
                    return false;
                };
                needles
                    .values()
                    .iter()
                    .any(|needle| values::array_contains(array.values(), needle))
            }
            Operator::In => match (other, self.value.as_array()) {
                (Some(other), Some(candidates)) => values::array_contains(candidates.values(), other),
                _ => false,
            },
            Operator::NotIn => {
                let Some(candidates) = self.value.as_array() else {
                    return false;
                };
                if candidates.values().iter().any(FirestoreValue::is_null) {
                    return false;
                }
                match other {
                    Some(other) if !other.is_null() => {
                        !values::array_contains(candidates.values(), other)
                    }
                    _ => false,
                }
            }
            Operator::NotEqual => match other {
                Some(other) if !other.is_null() => {
                    values::compare(other, &self.value) != Ordering::Equal
                }
                _ => false,
            },
            _ => match other {
                Some(other) if other.type_order() == self.value.type_order() => {
                    self.matches_comparison(values::compare(other, &self.value))
                }
                _ => false,
            },
        }
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self.op {
            Operator::LessThan => ordering == Ordering::Less,
            Operator::LessThanOrEqual => ordering != Ordering::Greater,
            Operator::Equal => ordering == Ordering::Equal,
            Operator::GreaterThan => ordering == Ordering::Greater,
            Operator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }

    fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.symbol(),
            values::canonical_id(&self.value)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompositeOperator {
    And,
    Or,
}

impl CompositeOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompositeOperator::And => "AND",
            CompositeOperator::Or => "OR",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Field(FieldFilter),
    Composite {
        op: CompositeOperator,
        filters: Vec<Filter>,
    },
}

impl Filter {
    pub fn field(field: FieldPath, op: Operator, value: FirestoreValue) -> Self {
        Filter::Field(FieldFilter::new(field, op, value))
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::Composite {
            op: CompositeOperator::And,
            filters,
        }
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Composite {
            op: CompositeOperator::Or,
            filters,
        }
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        match self {
            Filter::Field(filter) => filter.matches(document),
            Filter::Composite {
                op: CompositeOperator::And,
                filters,
            } => filters.iter().all(|filter| filter.matches(document)),
            Filter::Composite {
                op: CompositeOperator::Or,
                filters,
            } => filters.iter().any(|filter| filter.matches(document)),
        }
    }

    /// Every field filter in this tree, depth first.
    pub fn flattened(&self) -> Vec<&FieldFilter> {
        match self {
            Filter::Field(filter) => vec![filter],
            Filter::Composite { filters, .. } => {
                filters.iter().flat_map(Filter::flattened).collect()
            }
        }
    }

    fn canonical_id(&self) -> String {
        match self {
            Filter::Field(filter) => filter.canonical_id(),
            Filter::Composite { op, filters } => {
                let parts: Vec<String> = filters.iter().map(Filter::canonical_id).collect();
                format!("{}({})", op.as_str().to_lowercase(), parts.join(","))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ascending => "ASCENDING",
            Direction::Descending => "DESCENDING",
        }
    }

    pub fn flipped(&self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn ascending(field: FieldPath) -> Self {
        Self::new(field, Direction::Ascending)
    }

    /// Compares two documents on this ordering's field.
    pub fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let ordering = if self.field.is_document_id() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => values::compare(l, r),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }

    fn canonical_id(&self) -> String {
        let direction = match self.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        format!("{}{}", self.field.canonical_string(), direction)
    }
}

/// Cursor position; `inclusive` controls whether a document at exactly the
/// position is part of the result.
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    pub position: Vec<FirestoreValue>,
    pub inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    fn compare_to_document(&self, order_bys: &[OrderBy], document: &MutableDocument) -> Ordering {
        for (component, order_by) in self.position.iter().zip(order_bys) {
            let ordering = if order_by.field.is_document_id() {
                match key_from_reference(component) {
                    Some(key) => key.cmp(document.key()),
                    None => Ordering::Equal,
                }
            } else {
                match document.field(&order_by.field) {
                    Some(value) => values::compare(component, value),
                    None => Ordering::Greater,
                }
            };
            let ordering = match order_by.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Whether a start bound admits `document`.
    pub fn sorts_before_document(&self, order_bys: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_bys, document);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    /// Whether an end bound admits `document`.
    pub fn sorts_after_document(&self, order_bys: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_bys, document);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }

    fn canonical_id(&self) -> String {
        let mut out = String::from(if self.inclusive { "b:" } else { "a:" });
        let parts: Vec<String> = self.position.iter().map(values::canonical_id).collect();
        out.push_str(&parts.join(","));
        out
    }
}

/// Reference value used when comparing the document key against filters.
pub fn key_reference(key: &DocumentKey) -> FirestoreValue {
    FirestoreValue::from_reference(key.path().canonical_string())
}

/// Parses a reference value as a key, accepting both fully qualified resource
/// names and relative document paths.
pub fn key_from_reference(value: &FirestoreValue) -> Option<DocumentKey> {
    let ValueKind::Reference(name) = value.kind() else {
        return None;
    };
    let relative = match name.find("/documents/") {
        Some(index) => &name[index + "/documents/".len()..],
        None => name.as_str(),
    };
    DocumentKey::from_string(relative).ok()
}

/// The server-side shape of a query: what the watch stream listens to.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub filters: Vec<Filter>,
    pub order_bys: Vec<OrderBy>,
    pub limit: Option<u32>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Target {
    /// Single document target, used for limbo resolution.
    pub fn for_document(key: &DocumentKey) -> Self {
        Self {
            path: key.path().clone(),
            collection_group: None,
            filters: Vec::new(),
            order_bys: vec![OrderBy::ascending(FieldPath::document_id())],
            limit: None,
            start_at: None,
            end_at: None,
        }
    }

    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    /// Stable string used as the in-memory identity of this target.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            let _ = write!(id, "|cg:{group}");
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for order_by in &self.order_bys {
            id.push_str(&order_by.canonical_id());
        }
        if let Some(limit) = self.limit {
            let _ = write!(id, "|l:{limit}");
        }
        if let Some(bound) = &self.start_at {
            let _ = write!(id, "|lb:{}", bound.canonical_id());
        }
        if let Some(bound) = &self.end_at {
            let _ = write!(id, "|ub:{}", bound.canonical_id());
        }
        id
    }

    /// Fields referenced by filters, excluding the document key.
    pub fn filter_fields(&self) -> Vec<FieldPath> {
        let mut fields: Vec<FieldPath> = self
            .filters
            .iter()
            .flat_map(Filter::flattened)
            .map(|filter| filter.field.clone())
            .filter(|field| !field.is_document_id())
            .collect();
        fields.sort();
        fields.dedup();
        fields
    }

    pub fn matches_filters(&self, document: &MutableDocument) -> bool {
        self.filters.iter().all(|filter| filter.matches(document))
    }

    /// Type ordering of the first filter value on `field`, used by index
    /// selection.
    pub fn value_type_for(&self, field: &FieldPath) -> Option<TypeOrder> {
        self.filters
            .iter()
            .flat_map(Filter::flattened)
            .find(|filter| &filter.field == field)
            .map(|filter| filter.value.type_order())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::value::ObjectValue;

    fn doc(path: &str, field: &str, value: FirestoreValue) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_dot_separated(field).unwrap(), value);
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::min(),
            data,
        )
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    #[test]
    fn comparison_filters_require_matching_types() {
        let filter = FieldFilter::new(field("a"), Operator::GreaterThan, FirestoreValue::from_integer(1));
        assert!(filter.matches(&doc("c/1", "a", FirestoreValue::from_double(1.5))));
        assert!(!filter.matches(&doc("c/1", "a", FirestoreValue::from_string("z"))));
        assert!(!filter.matches(&doc("c/1", "b", FirestoreValue::from_integer(5))));
    }

    #[test]
    fn not_equal_skips_missing_and_null_fields() {
        let filter = FieldFilter::new(field("a"), Operator::NotEqual, FirestoreValue::from_integer(1));
        assert!(filter.matches(&doc("c/1", "a", FirestoreValue::from_integer(2))));
        assert!(!filter.matches(&doc("c/1", "a", FirestoreValue::null())));
        assert!(!filter.matches(&doc("c/1", "b", FirestoreValue::from_integer(2))));
    }

    #[test]
    fn composite_or_filter() {
        let filter = Filter::or(vec![
            Filter::field(field("a"), Operator::Equal, FirestoreValue::from_integer(1)),
            Filter::field(field("a"), Operator::Equal, FirestoreValue::from_integer(2)),
        ]);
        assert!(filter.matches(&doc("c/1", "a", FirestoreValue::from_integer(2))));
        assert!(!filter.matches(&doc("c/1", "a", FirestoreValue::from_integer(3))));
    }

    #[test]
    fn document_id_filters_compare_keys() {
        let filter = FieldFilter::new(
            FieldPath::document_id(),
            Operator::GreaterThan,
            FirestoreValue::from_reference("c/b"),
        );
        assert!(filter.matches(&doc("c/c", "a", FirestoreValue::null())));
        assert!(!filter.matches(&doc("c/a", "a", FirestoreValue::null())));
    }

    #[test]
    fn canonical_id_distinguishes_limits() {
        let base = Target::for_document(&DocumentKey::from_string("c/d").unwrap());
        let mut limited = base.clone();
        limited.limit = Some(1);
        assert_ne!(base.canonical_id(), limited.canonical_id());
    }
}
