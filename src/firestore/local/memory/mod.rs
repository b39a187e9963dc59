//! In-memory implementations of the local persistence traits.

mod bundle_cache;
mod document_overlay_cache;
mod eager_delegate;
mod index_manager;
mod mutation_queue;
mod persistence;
mod remote_document_cache;
mod target_cache;

pub use bundle_cache::MemoryBundleCache;
pub use document_overlay_cache::MemoryDocumentOverlayCache;
pub use eager_delegate::MemoryEagerDelegate;
pub use index_manager::MemoryIndexManager;
pub use mutation_queue::MemoryMutationQueue;
pub use persistence::MemoryPersistence;
pub use remote_document_cache::MemoryRemoteDocumentCache;
pub use target_cache::MemoryTargetCache;
