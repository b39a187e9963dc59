//! Local cache: persistence traits, their in-memory backend, and the local
//! store that combines them into the client's view of the data.

mod bundle_cache;
mod document_overlay_cache;
mod index_manager;
mod local_documents_view;
mod local_store;
pub mod memory;
mod mutation_queue;
mod persistence;
mod query_engine;
mod reference_set;
mod remote_document_cache;
mod shared_client_state;
mod target_cache;
mod target_data;

pub use bundle_cache::{BundleCache, BundleMetadata, NamedQuery};
pub use document_overlay_cache::DocumentOverlayCache;
pub use index_manager::{
    FieldIndex, IndexKind, IndexManager, IndexOffset, IndexSegment, IndexType,
};
pub use local_documents_view::LocalDocumentsView;
pub use local_store::{
    ignore_if_primary_lease_loss, LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult,
};
pub use mutation_queue::MutationQueue;
pub use persistence::{
    Persistence, PersistenceTransaction, ReferenceDelegate, TransactionBody, TransactionMode,
};
pub use query_engine::{QueryEngine, QueryEngineSettings};
pub use reference_set::ReferenceSet;
pub use remote_document_cache::{QueryContext, RemoteDocumentCache};
pub use shared_client_state::{
    MemorySharedClientState, MutationBatchState, QueryTargetState, SharedClientState,
};
pub use target_cache::TargetCache;
pub use target_data::{TargetData, TargetPurpose};
