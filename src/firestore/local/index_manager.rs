use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::firestore::core::Target;
use crate::firestore::model::{BatchId, DocumentKey, FieldPath, MutableDocument, ResourcePath, SnapshotVersion};
use crate::firestore::error::FirestoreResult;

/// How well the configured indexes serve a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexType {
    /// No index covers the target.
    None,
    /// An index covers some of the constrained fields; results must be
    /// filtered again and limits cannot be applied by the index.
    Partial,
    /// An index covers every constrained field.
    Full,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Ascending,
    Descending,
    Contains,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IndexSegment {
    pub field_path: FieldPath,
    pub kind: IndexKind,
}

impl IndexSegment {
    pub fn new(field_path: FieldPath, kind: IndexKind) -> Self {
        Self { field_path, kind }
    }
}

/// Position up to which an index has been backfilled. Documents whose
/// `(read_time, key)` sorts after the offset are not indexed yet. An offset
/// without a key sits after every document with the same read time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexOffset {
    pub read_time: SnapshotVersion,
    pub document_key: Option<DocumentKey>,
    pub largest_batch_id: BatchId,
}

impl IndexOffset {
    /// Offset before every document.
    pub fn none() -> Self {
        Self {
            read_time: SnapshotVersion::min(),
            document_key: None,
            largest_batch_id: -1,
        }
    }

    pub fn from_read_time(read_time: SnapshotVersion) -> Self {
        Self {
            read_time,
            document_key: None,
            largest_batch_id: -1,
        }
    }

    pub fn from_document(document: &MutableDocument) -> Self {
        Self {
            read_time: document.read_time(),
            document_key: Some(document.key().clone()),
            largest_batch_id: -1,
        }
    }

    /// Whether `document` was written after this offset.
    pub fn precedes(&self, document: &MutableDocument) -> bool {
        self.compare_to_document(document) == Ordering::Less
    }

    fn compare_to_document(&self, document: &MutableDocument) -> Ordering {
        self.read_time
            .cmp(&document.read_time())
            .then_with(|| match &self.document_key {
                Some(key) => key.cmp(document.key()),
                None => Ordering::Greater,
            })
    }
}

impl PartialOrd for IndexOffset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexOffset {
    fn cmp(&self, other: &Self) -> Ordering {
        let key_order = match (&self.document_key, &other.document_key) {
            (Some(left), Some(right)) => left.cmp(right),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        self.read_time
            .cmp(&other.read_time)
            .then(key_order)
            .then_with(|| self.largest_batch_id.cmp(&other.largest_batch_id))
    }
}

/// Client-side index definition over one collection group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldIndex {
    pub index_id: i32,
    pub collection_group: String,
    pub segments: Vec<IndexSegment>,
    pub offset: IndexOffset,
}

impl FieldIndex {
    pub fn new(collection_group: impl Into<String>, segments: Vec<IndexSegment>) -> Self {
        Self {
            index_id: -1,
            collection_group: collection_group.into(),
            segments,
            offset: IndexOffset::none(),
        }
    }

    pub fn fields(&self) -> Vec<&FieldPath> {
        self.segments.iter().map(|segment| &segment.field_path).collect()
    }
}

/// Collection parent registry plus field indexes used by the query engine.
pub trait IndexManager: Send {
    fn add_to_collection_parent_index(&mut self, collection_path: &ResourcePath);

    /// Parent paths of every known collection with id `collection_id`.
    fn get_collection_parents(&self, collection_id: &str) -> Vec<ResourcePath>;

    fn add_field_index(&mut self, index: FieldIndex) -> FirestoreResult<FieldIndex>;

    fn delete_field_index(&mut self, index_id: i32);

    fn delete_all_field_indexes(&mut self);

    fn get_field_indexes(&self, collection_group: Option<&str>) -> Vec<FieldIndex>;

    fn get_index_type(&self, target: &Target) -> IndexType;

    /// Keys the best index returns for `target`, `None` without a usable
    /// index. The result may contain documents that no longer match.
    fn get_documents_matching_target(&self, target: &Target) -> Option<Vec<DocumentKey>>;

    /// Offset of the index that serves `target`.
    fn get_min_offset(&self, target: &Target) -> IndexOffset;

    /// Collection group whose index was backfilled least recently.
    fn get_next_collection_group_to_update(&self) -> Option<String>;

    fn update_collection_group(&mut self, collection_group: &str, offset: IndexOffset);

    fn update_index_entries(&mut self, documents: &BTreeMap<DocumentKey, MutableDocument>);

    /// Creates an index covering every field `target` constrains.
    fn create_target_indexes(&mut self, target: &Target) -> FirestoreResult<()>;
}
