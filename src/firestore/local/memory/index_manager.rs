use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::{CompositeOperator, Direction, Filter, Operator, Target};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::{
    FieldIndex, IndexKind, IndexManager, IndexOffset, IndexSegment, IndexType,
};
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::firestore::value::ObjectValue;

/// Field indexes kept in memory. Each entry stores a projection of the
/// document restricted to the indexed fields, and only documents that carry
/// every indexed field get an entry.
#[derive(Clone, Debug, Default)]
pub struct MemoryIndexManager {
    collection_parents: BTreeMap<String, BTreeSet<ResourcePath>>,
    indexes: BTreeMap<i32, FieldIndex>,
    entries: BTreeMap<i32, BTreeMap<DocumentKey, MutableDocument>>,
    group_update_sequence: BTreeMap<String, u64>,
    next_index_id: i32,
    update_counter: u64,
}

impl MemoryIndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn collection_group_of(target: &Target) -> Option<String> {
        match &target.collection_group {
            Some(group) => Some(group.clone()),
            None => target.path.last_segment().map(str::to_string),
        }
    }

    fn has_disjunction(filters: &[Filter]) -> bool {
        filters.iter().any(|filter| match filter {
            Filter::Field(_) => false,
            Filter::Composite { op: CompositeOperator::Or, .. } => true,
            Filter::Composite { filters, .. } => Self::has_disjunction(filters),
        })
    }

    /// Fields an index must be drawn from to serve `target`.
    fn constrained_fields(target: &Target) -> BTreeSet<FieldPath> {
        let mut fields: BTreeSet<FieldPath> = target.filter_fields().into_iter().collect();
        fields.extend(
            target
                .order_bys
                .iter()
                .filter(|order| !order.field.is_document_id())
                .map(|order| order.field.clone()),
        );
        fields
    }

    /// Index with the most fields among those usable for `target`.
    fn best_index(&self, target: &Target) -> Option<(&FieldIndex, IndexType)> {
        if target.is_document_target() || Self::has_disjunction(&target.filters) {
            return None;
        }
        let group = Self::collection_group_of(target)?;
        let required = Self::constrained_fields(target);
        self.indexes
            .values()
            .filter(|index| index.collection_group == group && !index.segments.is_empty())
            .filter(|index| index.fields().into_iter().all(|field| required.contains(field)))
            .max_by_key(|index| (index.segments.len(), -index.index_id))
            .map(|index| {
                let index_type = if index.segments.len() == required.len() {
                    IndexType::Full
                } else {
                    IndexType::Partial
                };
                (index, index_type)
            })
    }

    fn project(index: &FieldIndex, document: &MutableDocument) -> Option<MutableDocument> {
        if !document.is_found_document() {
            return None;
        }
        let mut data = ObjectValue::empty();
        for field in index.fields() {
            data.set(field, document.field(field)?.clone());
        }
        Some(MutableDocument::new_found_document(
            document.key().clone(),
            document.version(),
            data,
        ))
    }

    fn matches_path(target: &Target, key: &DocumentKey) -> bool {
        match &target.collection_group {
            Some(group) => key.has_collection_id(group) && target.path.is_prefix_of(key.path()),
            None => target.path.is_immediate_parent_of(key.path()),
        }
    }
}

impl IndexManager for MemoryIndexManager {
    fn add_to_collection_parent_index(&mut self, collection_path: &ResourcePath) {
        if let Some(collection_id) = collection_path.last_segment() {
            self.collection_parents
                .entry(collection_id.to_string())
                .or_default()
                .insert(collection_path.without_last());
        }
    }

    fn get_collection_parents(&self, collection_id: &str) -> Vec<ResourcePath> {
        self.collection_parents
            .get(collection_id)
            .map(|parents| parents.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn add_field_index(&mut self, index: FieldIndex) -> FirestoreResult<FieldIndex> {
        if let Some(existing) = self.indexes.values().find(|candidate| {
            candidate.collection_group == index.collection_group && candidate.segments == index.segments
        }) {
            return Ok(existing.clone());
        }
        self.next_index_id += 1;
        let index = FieldIndex {
            index_id: self.next_index_id,
            ..index
        };
        log::debug!(
            "index manager: created index {} on {} ({} fields)",
            index.index_id,
            index.collection_group,
            index.segments.len()
        );
        self.group_update_sequence
            .entry(index.collection_group.clone())
            .or_insert(0);
        self.entries.insert(index.index_id, BTreeMap::new());
        self.indexes.insert(index.index_id, index.clone());
        Ok(index)
    }

    fn delete_field_index(&mut self, index_id: i32) {
        if let Some(index) = self.indexes.remove(&index_id) {
            self.entries.remove(&index_id);
            let group_in_use = self
                .indexes
                .values()
                .any(|other| other.collection_group == index.collection_group);
            if !group_in_use {
                self.group_update_sequence.remove(&index.collection_group);
            }
        }
    }

    fn delete_all_field_indexes(&mut self) {
        self.indexes.clear();
        self.entries.clear();
        self.group_update_sequence.clear();
    }

    fn get_field_indexes(&self, collection_group: Option<&str>) -> Vec<FieldIndex> {
        self.indexes
            .values()
            .filter(|index| collection_group.map_or(true, |group| index.collection_group == group))
            .cloned()
            .collect()
    }

    fn get_index_type(&self, target: &Target) -> IndexType {
        self.best_index(target)
            .map(|(_, index_type)| index_type)
            .unwrap_or(IndexType::None)
    }

    fn get_documents_matching_target(&self, target: &Target) -> Option<Vec<DocumentKey>> {
        let (index, _) = self.best_index(target)?;
        let indexed: BTreeSet<&FieldPath> = index.fields().into_iter().collect();
        let usable_filters: Vec<&Filter> = target
            .filters
            .iter()
            .filter(|filter| {
                filter
                    .flattened()
                    .iter()
                    .all(|field_filter| field_filter.field.is_document_id() || indexed.contains(&field_filter.field))
            })
            .collect();

        let entries = self.entries.get(&index.index_id)?;
        Some(
            entries
                .iter()
                .filter(|(key, _)| Self::matches_path(target, key))
                .filter(|(_, projection)| usable_filters.iter().all(|filter| filter.matches(projection)))
                .map(|(key, _)| key.clone())
                .collect(),
        )
    }

    fn get_min_offset(&self, target: &Target) -> IndexOffset {
        self.best_index(target)
            .map(|(index, _)| index.offset.clone())
            .unwrap_or_else(IndexOffset::none)
    }

    fn get_next_collection_group_to_update(&self) -> Option<String> {
        self.group_update_sequence
            .iter()
            .min_by(|left, right| left.1.cmp(right.1).then_with(|| left.0.cmp(right.0)))
            .map(|(group, _)| group.clone())
    }

    fn update_collection_group(&mut self, collection_group: &str, offset: IndexOffset) {
        self.update_counter += 1;
        self.group_update_sequence
            .insert(collection_group.to_string(), self.update_counter);
        for index in self.indexes.values_mut() {
            if index.collection_group == collection_group {
                index.offset = offset.clone();
            }
        }
    }

    fn update_index_entries(&mut self, documents: &BTreeMap<DocumentKey, MutableDocument>) {
        for (key, document) in documents {
            let group = key.collection_group();
            for index in self.indexes.values() {
                if index.collection_group != group {
                    continue;
                }
                let Some(entries) = self.entries.get_mut(&index.index_id) else {
                    continue;
                };
                match Self::project(index, document) {
                    Some(projection) => {
                        entries.insert(key.clone(), projection);
                    }
                    None => {
                        entries.remove(key);
                    }
                }
            }
        }
    }

    fn create_target_indexes(&mut self, target: &Target) -> FirestoreResult<()> {
        if target.is_document_target()
            || Self::has_disjunction(&target.filters)
            || self.get_index_type(target) == IndexType::Full
        {
            return Ok(());
        }
        let Some(group) = Self::collection_group_of(target) else {
            return Ok(());
        };

        let mut segments: Vec<IndexSegment> = Vec::new();
        let mut push = |field: &FieldPath, kind: IndexKind| {
            if !field.is_document_id() && !segments.iter().any(|segment| &segment.field_path == field) {
                segments.push(IndexSegment::new(field.clone(), kind));
            }
        };
        for filter in target.filters.iter().flat_map(Filter::flattened) {
            let kind = match filter.op {
                Operator::ArrayContains | Operator::ArrayContainsAny => IndexKind::Contains,
                _ => IndexKind::Ascending,
            };
            push(&filter.field, kind);
        }
        for order in &target.order_bys {
            let kind = match order.direction {
                Direction::Ascending => IndexKind::Ascending,
                Direction::Descending => IndexKind::Descending,
            };
            push(&order.field, kind);
        }
        if segments.is_empty() {
            return Ok(());
        }
        self.add_field_index(FieldIndex::new(group, segments))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{OrderBy, Query};
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::value::FirestoreValue;

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn doc(path: &str, fields: &[(&str, i64)]) -> MutableDocument {
        let mut data = ObjectValue::empty();
        for (name, value) in fields {
            data.set(&field(name), FirestoreValue::from_integer(*value));
        }
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::min(),
            data,
        )
    }

    fn query() -> Query {
        Query::collection(ResourcePath::from_string("c").unwrap()).with_filter(Filter::field(
            field("a"),
            Operator::Equal,
            FirestoreValue::from_integer(1),
        ))
    }

    #[test]
    fn index_type_depends_on_covered_fields() {
        let mut manager = MemoryIndexManager::new();
        let target = query().to_target();
        assert_eq!(manager.get_index_type(&target), IndexType::None);

        manager
            .add_field_index(FieldIndex::new(
                "c",
                vec![IndexSegment::new(field("a"), IndexKind::Ascending)],
            ))
            .unwrap();
        assert_eq!(manager.get_index_type(&target), IndexType::Full);

        let ordered = query().with_order_by(OrderBy::ascending(field("b"))).to_target();
        assert_eq!(manager.get_index_type(&ordered), IndexType::Partial);
    }

    #[test]
    fn entries_answer_targets() {
        let mut manager = MemoryIndexManager::new();
        let target = query().to_target();
        manager.create_target_indexes(&target).unwrap();
        assert_eq!(manager.get_field_indexes(Some("c")).len(), 1);

        let documents: BTreeMap<DocumentKey, MutableDocument> = [
            doc("c/1", &[("a", 1)]),
            doc("c/2", &[("a", 2)]),
            doc("c/3", &[("b", 1)]),
            doc("d/x/c/4", &[("a", 1)]),
        ]
        .into_iter()
        .map(|document| (document.key().clone(), document))
        .collect();
        manager.update_index_entries(&documents);

        let keys = manager.get_documents_matching_target(&target).unwrap();
        assert_eq!(keys, vec![DocumentKey::from_string("c/1").unwrap()]);
        assert_eq!(manager.get_next_collection_group_to_update().as_deref(), Some("c"));
    }
}
