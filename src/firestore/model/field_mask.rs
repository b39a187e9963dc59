use std::collections::BTreeSet;

use crate::firestore::model::FieldPath;

/// Set of field paths touched by a patch. A mask covers a path when one of
/// its entries is a prefix of that path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new(fields: impl IntoIterator<Item = FieldPath>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeSet<FieldPath> {
        &self.fields
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn insert(&mut self, path: FieldPath) {
        self.fields.insert(path);
    }

    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|entry| entry.is_prefix_of(path))
    }

    pub fn union(mut self, other: &FieldMask) -> FieldMask {
        self.fields.extend(other.fields.iter().cloned());
        self
    }
}

impl FromIterator<FieldPath> for FieldMask {
    fn from_iter<T: IntoIterator<Item = FieldPath>>(iter: T) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_nested_paths() {
        let mask = FieldMask::new([FieldPath::from_dot_separated("a.b").unwrap()]);
        assert!(mask.covers(&FieldPath::from_dot_separated("a.b.c").unwrap()));
        assert!(!mask.covers(&FieldPath::from_dot_separated("a").unwrap()));
    }
}
