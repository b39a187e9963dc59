use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, ResourcePath};

pub const DEFAULT_DATABASE_ID: &str = "(default)";

/// Identifies the project and database a client is bound to. Used to build and
/// parse fully-qualified resource names on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn default_for(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn is_default_database(&self) -> bool {
        self.database == DEFAULT_DATABASE_ID
    }

    /// `projects/{project}/databases/{database}`
    pub fn database_name(&self) -> String {
        format!("projects/{}/databases/{}", self.project_id, self.database)
    }

    /// Full resource name of a document, used by the bloom filter and the wire
    /// codec.
    pub fn document_name(&self, key: &DocumentKey) -> String {
        format!("{}/documents/{}", self.database_name(), key.path())
    }

    pub fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            format!("{}/documents", self.database_name())
        } else {
            format!("{}/documents/{}", self.database_name(), path)
        }
    }

    /// Extracts the document path from a resource name that belongs to this
    /// database.
    pub fn path_from_name(&self, name: &str) -> FirestoreResult<ResourcePath> {
        let prefix = format!("{}/documents", self.database_name());
        let remainder = name.strip_prefix(&prefix).ok_or_else(|| {
            invalid_argument(format!(
                "Resource name {name} does not belong to {}",
                self.database_name()
            ))
        })?;
        ResourcePath::from_string(remainder)
    }
}
