use std::collections::BTreeMap;

use crate::firestore::local::{BundleCache, BundleMetadata, NamedQuery};

#[derive(Clone, Debug, Default)]
pub struct MemoryBundleCache {
    bundles: BTreeMap<String, BundleMetadata>,
    named_queries: BTreeMap<String, NamedQuery>,
}

impl MemoryBundleCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BundleCache for MemoryBundleCache {
    fn get_bundle_metadata(&self, bundle_id: &str) -> Option<BundleMetadata> {
        self.bundles.get(bundle_id).cloned()
    }

    fn save_bundle_metadata(&mut self, metadata: BundleMetadata) {
        self.bundles.insert(metadata.id.clone(), metadata);
    }

    fn get_named_query(&self, name: &str) -> Option<NamedQuery> {
        self.named_queries.get(name).cloned()
    }

    fn save_named_query(&mut self, query: NamedQuery) {
        self.named_queries.insert(query.name.clone(), query);
    }
}
