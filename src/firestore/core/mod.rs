//! Query model, views and the components that turn local and remote changes
//! into snapshots for listeners.

pub mod event_manager;
pub mod firestore_client;
mod query;
pub mod sync_engine;
mod target;
mod target_id_generator;
pub mod transaction;
pub mod transaction_runner;
pub mod view;
pub mod view_snapshot;

pub use event_manager::{
    EventManager, ListenOptions, ListenSource, QueryCallback, SnapshotsInSyncCallback,
};
pub use firestore_client::{ClientComponents, FirestoreClient, ListenerRegistration};
pub use query::{LimitType, Query};
pub use sync_engine::{SyncEngine, SyncEngineListener, WriteCompletion};
pub use target::{
    key_from_reference, key_reference, Bound, CompositeOperator, Direction, FieldFilter, Filter,
    Operator, OrderBy, Target,
};
pub use target_id_generator::TargetIdGenerator;
pub use transaction::Transaction;
pub use transaction_runner::{TransactionRunner, DEFAULT_MAX_ATTEMPTS};
pub use view::{LimboDocumentChange, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot};
