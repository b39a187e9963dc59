use crate::firestore::core::Query;
use crate::firestore::model::SnapshotVersion;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BundleMetadata {
    pub id: String,
    pub version: i32,
    pub create_time: SnapshotVersion,
    pub total_documents: u32,
    pub total_bytes: u64,
}

/// Query saved under a name by a loaded bundle.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedQuery {
    pub name: String,
    pub query: Query,
    pub read_time: SnapshotVersion,
}

pub trait BundleCache: Send {
    fn get_bundle_metadata(&self, bundle_id: &str) -> Option<BundleMetadata>;

    fn save_bundle_metadata(&mut self, metadata: BundleMetadata);

    fn get_named_query(&self, name: &str) -> Option<NamedQuery>;

    fn save_named_query(&mut self, query: NamedQuery);
}
