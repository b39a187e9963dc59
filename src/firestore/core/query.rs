use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::firestore::core::target::{Bound, Direction, Filter, OrderBy, Target};
use crate::firestore::model::{DocumentComparator, DocumentKey, FieldPath, MutableDocument, ResourcePath};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

/// User query built from plain data. Converted to a [`Target`] for the
/// watch stream and the caches.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    explicit_order_bys: Vec<OrderBy>,
    filters: Vec<Filter>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Query over the documents directly under `path`, or a single document
    /// when `path` names one.
    pub fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            explicit_order_bys: Vec::new(),
            filters: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection(path: ResourcePath) -> Self {
        Self::at_path(path)
    }

    pub fn collection_group(group: impl Into<String>) -> Self {
        let mut query = Self::at_path(ResourcePath::root());
        query.collection_group = Some(group.into());
        query
    }

    pub fn document(key: &DocumentKey) -> Self {
        Self::at_path(key.path().clone())
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_bys.push(order_by);
        self
    }

    pub fn with_limit(mut self, limit: Option<u32>, limit_type: LimitType) -> Self {
        self.limit = limit;
        self.limit_type = limit_type;
        self
    }

    pub fn limit_to_first(self, limit: u32) -> Self {
        self.with_limit(Some(limit), LimitType::First)
    }

    pub fn limit_to_last(self, limit: u32) -> Self {
        self.with_limit(Some(limit), LimitType::Last)
    }

    pub fn starting_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn ending_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn explicit_order_bys(&self) -> &[OrderBy] {
        &self.explicit_order_bys
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True when the query returns every document in its collection, in key
    /// order.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_bys.is_empty()
                || (self.explicit_order_bys.len() == 1
                    && self.explicit_order_bys[0].field.is_document_id()))
    }

    fn inequality_fields(&self) -> BTreeSet<FieldPath> {
        self.filters
            .iter()
            .flat_map(Filter::flattened)
            .filter(|filter| filter.op.is_inequality())
            .map(|filter| filter.field.clone())
            .collect()
    }

    /// Explicit orderings followed by the implicit ones: inequality fields
    /// that are not ordered yet, then the document key.
    pub fn normalized_order_bys(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_bys.clone();
        let mut seen: BTreeSet<FieldPath> = result.iter().map(|order| order.field.clone()).collect();
        let last_direction = self
            .explicit_order_bys
            .last()
            .map(|order| order.direction)
            .unwrap_or(Direction::Ascending);

        for field in self.inequality_fields() {
            if !seen.contains(&field) && !field.is_document_id() {
                seen.insert(field.clone());
                result.push(OrderBy::new(field, last_direction));
            }
        }
        if !seen.contains(&FieldPath::document_id()) {
            result.push(OrderBy::new(FieldPath::document_id(), last_direction));
        }
        result
    }

    /// Server shape of this query. Limit-to-last queries flip every ordering
    /// and swap their bounds.
    pub fn to_target(&self) -> Target {
        let order_bys = self.normalized_order_bys();
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_bys,
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            LimitType::Last => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_bys: order_bys
                    .into_iter()
                    .map(|order| OrderBy::new(order.field, order.direction.flipped()))
                    .collect(),
                limit: self.limit,
                start_at: self.end_at.clone(),
                end_at: self.start_at.clone(),
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        let suffix = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{}", self.to_target().canonical_id(), suffix)
    }

    /// Collection query rooted at `path`, used to expand collection group
    /// queries per parent.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        let mut query = self.clone();
        query.path = path;
        query.collection_group = None;
        query
    }

    pub fn without_limit(&self) -> Self {
        let mut query = self.clone();
        query.limit = None;
        query.limit_type = LimitType::First;
        query
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        document.is_found_document()
            && self.matches_path_and_collection_group(document)
            && self.matches_order_by(document)
            && self.matches_filters(document)
            && self.matches_bounds(document)
    }

    fn matches_path_and_collection_group(&self, document: &MutableDocument) -> bool {
        let path = document.key().path();
        if let Some(group) = &self.collection_group {
            document.key().has_collection_id(group) && self.path.is_prefix_of(path)
        } else if DocumentKey::is_document_key(&self.path) {
            &self.path == path
        } else {
            self.path.is_immediate_parent_of(path)
        }
    }

    fn matches_order_by(&self, document: &MutableDocument) -> bool {
        // Documents missing an ordered field never match, even under an
        // explicit inequality on another field.
        self.normalized_order_bys()
            .iter()
            .all(|order| order.field.is_document_id() || document.field(&order.field).is_some())
    }

    fn matches_filters(&self, document: &MutableDocument) -> bool {
        self.filters.iter().all(|filter| filter.matches(document))
    }

    fn matches_bounds(&self, document: &MutableDocument) -> bool {
        let order_bys = self.normalized_order_bys();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_bys, document) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_bys, document) {
                return false;
            }
        }
        true
    }

    /// Comparator implementing this query's result order.
    pub fn comparator(&self) -> DocumentComparator {
        let order_bys = self.normalized_order_bys();
        Arc::new(move |left: &MutableDocument, right: &MutableDocument| {
            for order in &order_bys {
                let ordering = order.compare(left, right);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        })
    }

    /// Sorts matching documents and applies the limit.
    pub fn apply_to_documents(&self, documents: impl IntoIterator<Item = MutableDocument>) -> Vec<MutableDocument> {
        let comparator = self.comparator();
        let mut results: Vec<MutableDocument> =
            documents.into_iter().filter(|doc| self.matches(doc)).collect();
        results.sort_by(|left, right| comparator(left, right));
        if let Some(limit) = self.limit {
            let limit = limit as usize;
            if results.len() > limit {
                match self.limit_type {
                    LimitType::First => results.truncate(limit),
                    LimitType::Last => {
                        let start = results.len() - limit;
                        results.drain(0..start);
                    }
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::target::Operator;
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::value::{FirestoreValue, ObjectValue};

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn doc(path: &str, population: i64) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(&field("population"), FirestoreValue::from_integer(population));
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::min(),
            data,
        )
    }

    fn cities() -> Query {
        Query::collection(ResourcePath::from_string("cities").unwrap())
    }

    #[test]
    fn applies_limit_and_ordering() {
        let query = cities()
            .with_order_by(OrderBy::ascending(field("population")))
            .limit_to_first(2);
        let result = query.apply_to_documents(vec![
            doc("cities/sf", 100),
            doc("cities/nyc", 50),
            doc("cities/la", 75),
        ]);
        let ids: Vec<&str> = result.iter().map(|d| d.key().id()).collect();
        assert_eq!(ids, vec!["nyc", "la"]);
    }

    #[test]
    fn limit_to_last_keeps_tail_and_flips_target() {
        let query = cities()
            .with_order_by(OrderBy::ascending(field("population")))
            .limit_to_last(1);
        let result = query.apply_to_documents(vec![doc("cities/sf", 100), doc("cities/la", 75)]);
        assert_eq!(result[0].key().id(), "sf");
        assert_eq!(query.to_target().order_bys[0].direction, Direction::Descending);
    }

    #[test]
    fn inequality_adds_implicit_order() {
        let query = cities().with_filter(Filter::field(
            field("population"),
            Operator::GreaterThan,
            FirestoreValue::from_integer(10),
        ));
        let order_bys = query.normalized_order_bys();
        assert_eq!(order_bys.len(), 2);
        assert_eq!(order_bys[0].field, field("population"));
        assert!(order_bys[1].field.is_document_id());
    }

    #[test]
    fn only_direct_children_match_collection_queries() {
        let query = cities();
        assert!(query.matches(&doc("cities/sf", 1)));
        assert!(!query.matches(&doc("cities/sf/landmarks/bridge", 1)));
        let group = Query::collection_group("landmarks");
        assert!(group.matches(&doc("cities/sf/landmarks/bridge", 1)));
    }

    #[test]
    fn start_bound_is_respected() {
        let query = cities()
            .with_order_by(OrderBy::ascending(field("population")))
            .starting_at(Bound::new(vec![FirestoreValue::from_integer(75)], false));
        assert!(!query.matches(&doc("cities/la", 75)));
        assert!(query.matches(&doc("cities/sf", 100)));
    }
}
