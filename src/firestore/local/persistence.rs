use std::collections::BTreeSet;

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::{
    BundleCache, DocumentOverlayCache, IndexManager, MutationQueue, RemoteDocumentCache, TargetCache,
};
use crate::firestore::model::{DocumentKey, ListenSequenceNumber, TargetId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Read-write access that additionally requires this client to hold the
    /// primary lease.
    ReadWritePrimary,
}

impl TransactionMode {
    pub fn is_read_only(&self) -> bool {
        matches!(self, TransactionMode::ReadOnly)
    }
}

/// Tracks which cached documents are still referenced so unreferenced ones
/// can be collected when a transaction commits.
pub trait ReferenceDelegate: Send {
    fn add_reference(&mut self, target_id: TargetId, key: &DocumentKey);

    fn remove_reference(&mut self, target_id: TargetId, key: &DocumentKey);

    fn remove_mutation_reference(&mut self, key: &DocumentKey);

    /// Called with the matching keys of a target that is being removed.
    fn remove_target(&mut self, target_id: TargetId, keys: &BTreeSet<DocumentKey>);

    fn update_limbo_document(&mut self, key: &DocumentKey);

    /// Flags `key` for a reference check when the transaction commits.
    fn mark_potentially_orphaned(&mut self, key: &DocumentKey);

    /// Pins documents that an active view currently shows.
    fn add_local_view_references(&mut self, target_id: TargetId, keys: &BTreeSet<DocumentKey>);

    fn remove_local_view_references(&mut self, target_id: TargetId, keys: &BTreeSet<DocumentKey>);

    fn remove_local_view_references_for_target(&mut self, target_id: TargetId);
}

/// Components visible inside one persistence transaction. Everything written
/// through these handles commits atomically when the transaction body
/// returns `Ok`, and is discarded otherwise.
pub struct PersistenceTransaction<'a> {
    pub label: &'static str,
    pub mode: TransactionMode,
    /// Listen sequence number assigned to this transaction.
    pub sequence_number: ListenSequenceNumber,
    pub mutation_queue: &'a mut dyn MutationQueue,
    pub remote_documents: &'a mut dyn RemoteDocumentCache,
    pub overlays: &'a mut dyn DocumentOverlayCache,
    pub targets: &'a mut dyn TargetCache,
    pub bundles: &'a mut dyn BundleCache,
    pub index_manager: &'a mut dyn IndexManager,
    pub references: &'a mut dyn ReferenceDelegate,
}

pub type TransactionBody<'b> = dyn FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<()> + 'b;

/// Storage backend for the local store.
pub trait Persistence: Send + Sync {
    fn start(&self) -> FirestoreResult<()>;

    fn shutdown(&self);

    fn is_started(&self) -> bool;

    /// Grants or revokes the primary lease. `ReadWritePrimary` transactions
    /// fail with the primary-lease-lost error while revoked.
    fn set_primary(&self, primary: bool);

    fn is_primary(&self) -> bool;

    /// Switches the mutation queue and overlays to another user. `None` is
    /// the unauthenticated user.
    fn set_user(&self, uid: Option<String>);

    fn run_transaction(
        &self,
        label: &'static str,
        mode: TransactionMode,
        body: &mut TransactionBody<'_>,
    ) -> FirestoreResult<()>;
}

impl dyn Persistence {
    /// Runs `body` in a transaction and returns its result.
    pub fn run<T>(
        &self,
        label: &'static str,
        mode: TransactionMode,
        mut body: impl FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<T>,
    ) -> FirestoreResult<T> {
        let mut output = None;
        self.run_transaction(label, mode, &mut |txn: &mut PersistenceTransaction<'_>| {
            output = Some(body(txn)?);
            Ok(())
        })?;
        output.ok_or_else(|| internal_error(format!("transaction '{label}' produced no result")))
    }
}
