use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::firestore::model::{DocumentKey, MutableDocument};

pub type DocumentComparator =
    Arc<dyn Fn(&MutableDocument, &MutableDocument) -> Ordering + Send + Sync>;

/// Documents kept in query order, with lookup by key.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, MutableDocument>,
    sorted: Vec<MutableDocument>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    /// Set ordered by key only.
    pub fn by_key_order() -> Self {
        Self::new(Arc::new(|left: &MutableDocument, right: &MutableDocument| {
            left.key().cmp(right.key())
        }))
    }

    pub fn comparator(&self) -> DocumentComparator {
        Arc::clone(&self.comparator)
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&MutableDocument> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&MutableDocument> {
        self.sorted.last()
    }

    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.by_key.get(key)?;
        self.position(document).ok()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &MutableDocument> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.by_key.keys()
    }

    /// Inserts or replaces the document with the same key.
    pub fn add(&mut self, document: MutableDocument) {
        self.delete(document.key());
        let index = match self.position(&document) {
            Ok(index) | Err(index) => index,
        };
        self.by_key.insert(document.key().clone(), document.clone());
        self.sorted.insert(index, document);
    }

    pub fn delete(&mut self, key: &DocumentKey) {
        let Some(existing) = self.by_key.remove(key) else {
            return;
        };
        if let Ok(index) = self.position(&existing) {
            self.sorted.remove(index);
        } else if let Some(index) = self.sorted.iter().position(|doc| doc.key() == key) {
            self.sorted.remove(index);
        }
    }

    fn position(&self, document: &MutableDocument) -> Result<usize, usize> {
        let comparator = &self.comparator;
        self.sorted
            .binary_search_by(|probe| comparator(probe, document).then_with(|| probe.key().cmp(document.key())))
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted.len() == other.sorted.len()
            && self
                .sorted
                .iter()
                .zip(&other.sorted)
                .all(|(left, right)| left.key() == right.key() && left.data() == right.data())
    }
}

impl Debug for DocumentSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.sorted.iter().map(|doc| doc.key().to_string()))
            .finish()
    }
}
