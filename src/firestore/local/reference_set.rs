use std::collections::BTreeSet;

use crate::firestore::model::DocumentKey;

/// Bidirectional (key, id) reference index. The id is a target id or batch
/// id depending on the owner.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, i32)>,
    by_id: BTreeSet<(i32, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        self.by_id.insert((id, key.clone()));
        self.by_key.insert((key, id));
    }

    pub fn add_references<'a>(&mut self, keys: impl IntoIterator<Item = &'a DocumentKey>, id: i32) {
        for key in keys {
            self.add_reference(key.clone(), id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) {
        self.by_id.remove(&(id, key.clone()));
        self.by_key.remove(&(key.clone(), id));
    }

    pub fn remove_references<'a>(&mut self, keys: impl IntoIterator<Item = &'a DocumentKey>, id: i32) {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Removes every reference held by `id` and returns the released keys.
    pub fn remove_references_for_id(&mut self, id: i32) -> BTreeSet<DocumentKey> {
        let keys = self.references_for_id(id);
        for key in &keys {
            self.remove_reference(key, id);
        }
        keys
    }

    pub fn remove_all_references(&mut self) -> BTreeSet<DocumentKey> {
        let keys = self.by_key.iter().map(|(key, _)| key.clone()).collect();
        self.by_key.clear();
        self.by_id.clear();
        keys
    }

    pub fn references_for_id(&self, id: i32) -> BTreeSet<DocumentKey> {
        self.by_id
            .iter()
            .skip_while(|(candidate, _)| *candidate < id)
            .take_while(|(candidate, _)| *candidate == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn ids_for_key(&self, key: &DocumentKey) -> Vec<i32> {
        self.by_key
            .range((key.clone(), i32::MIN)..=(key.clone(), i32::MAX))
            .map(|(_, id)| *id)
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.by_key.iter().map(|(key, _)| key)
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((key.clone(), i32::MIN)..=(key.clone(), i32::MAX))
            .next()
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn tracks_references_per_id() {
        let mut references = ReferenceSet::new();
        references.add_reference(key("c/a"), 1);
        references.add_reference(key("c/b"), 1);
        references.add_reference(key("c/a"), 2);
        assert_eq!(references.references_for_id(1).len(), 2);

        let released = references.remove_references_for_id(1);
        assert_eq!(released.len(), 2);
        assert!(references.contains_key(&key("c/a")));
        assert!(!references.contains_key(&key("c/b")));
    }
}
