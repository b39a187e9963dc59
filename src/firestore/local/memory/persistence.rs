use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::firestore::error::{failed_precondition, primary_lease_lost, FirestoreResult};
use crate::firestore::local::memory::{
    MemoryBundleCache, MemoryDocumentOverlayCache, MemoryEagerDelegate, MemoryIndexManager,
    MemoryMutationQueue, MemoryRemoteDocumentCache, MemoryTargetCache,
};
use crate::firestore::local::{
    MutationQueue, Persistence, PersistenceTransaction, RemoteDocumentCache, TargetCache,
    TransactionBody, TransactionMode,
};
use crate::firestore::model::ListenSequenceNumber;

#[derive(Clone, Debug, Default)]
struct MemoryState {
    /// Per-user queues; the empty string is the unauthenticated user.
    mutation_queues: BTreeMap<String, MemoryMutationQueue>,
    overlays: BTreeMap<String, MemoryDocumentOverlayCache>,
    remote_documents: MemoryRemoteDocumentCache,
    targets: MemoryTargetCache,
    bundles: MemoryBundleCache,
    index_manager: MemoryIndexManager,
    delegate: MemoryEagerDelegate,
    current_user: String,
    sequence_number: ListenSequenceNumber,
}

impl MemoryState {
    /// Drops cached documents that lost their last reference during the
    /// transaction.
    fn collect_orphans(&mut self) {
        let candidates = self.delegate.take_orphaned();
        if candidates.is_empty() {
            return;
        }
        let mut removed = 0usize;
        for key in candidates {
            let referenced = self.targets.contains_key(&key)
                || self.delegate.is_referenced_by_local_view(&key)
                || self.mutation_queues.values().any(|queue| queue.contains_key(&key));
            if !referenced {
                self.remote_documents.remove_entry(&key);
                removed += 1;
            }
        }
        if removed > 0 {
            log::debug!("memory persistence: collected {removed} orphaned documents");
        }
    }
}

/// Persistence backed by plain in-memory maps. Transactions run against a
/// copy of the state that replaces the live state only when the body
/// succeeds, so a failed transaction leaves nothing behind.
#[derive(Debug)]
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
    started: AtomicBool,
    primary: AtomicBool,
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            started: AtomicBool::new(false),
            primary: AtomicBool::new(true),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Persistence for MemoryPersistence {
    fn start(&self) -> FirestoreResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(failed_precondition("MemoryPersistence already started"));
        }
        let mut state = self.state();
        state.sequence_number = state.targets.highest_listen_sequence_number();
        Ok(())
    }

    fn shutdown(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn set_primary(&self, primary: bool) {
        let previous = self.primary.swap(primary, Ordering::SeqCst);
        if previous != primary {
            log::debug!("memory persistence: primary state changed to {primary}");
        }
    }

    fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    fn set_user(&self, uid: Option<String>) {
        self.state().current_user = uid.unwrap_or_default();
    }

    fn run_transaction(
        &self,
        label: &'static str,
        mode: TransactionMode,
        body: &mut TransactionBody<'_>,
    ) -> FirestoreResult<()> {
        if !self.is_started() {
            return Err(failed_precondition(format!(
                "Cannot run transaction '{label}' before persistence is started"
            )));
        }
        if mode == TransactionMode::ReadWritePrimary && !self.is_primary() {
            log::debug!("memory persistence: transaction '{label}' rejected, not primary");
            return Err(primary_lease_lost());
        }
        log::trace!("memory persistence: starting transaction '{label}'");

        let mut guard = self.state();
        let mut working = guard.clone();
        let sequence_number = if mode.is_read_only() {
            working.sequence_number
        } else {
            working.sequence_number + 1
        };

        {
            let MemoryState {
                mutation_queues,
                overlays,
                remote_documents,
                targets,
                bundles,
                index_manager,
                delegate,
                current_user,
                ..
            } = &mut working;
            let mut txn = PersistenceTransaction {
                label,
                mode,
                sequence_number,
                mutation_queue: mutation_queues.entry(current_user.clone()).or_default(),
                remote_documents,
                overlays: overlays.entry(current_user.clone()).or_default(),
                targets,
                bundles,
                index_manager,
                references: delegate,
            };
            body(&mut txn)?;
        }

        if mode.is_read_only() {
            return Ok(());
        }
        working.sequence_number = sequence_number;
        working.collect_orphans();
        if let Some(queue) = working.mutation_queues.get(&working.current_user) {
            queue.perform_consistency_check()?;
        }
        *guard = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{internal_error, FirestoreErrorCode};
    use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion, Timestamp};
    use crate::firestore::value::ObjectValue;

    fn started() -> MemoryPersistence {
        let persistence = MemoryPersistence::new();
        persistence.start().unwrap();
        persistence
    }

    fn doc(path: &str) -> MutableDocument {
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            ObjectValue::empty(),
        )
    }

    #[test]
    fn failed_transactions_leave_no_partial_state() {
        let persistence = started();
        let persistence: &dyn Persistence = &persistence;
        let result = persistence.run("failing", TransactionMode::ReadWrite, |txn| {
            txn.remote_documents
                .add_entry(doc("c/a"), SnapshotVersion::new(Timestamp::new(1, 0)))?;
            Err::<(), _>(internal_error("boom"))
        });
        assert!(result.is_err());

        let size = persistence
            .run("read", TransactionMode::ReadOnly, |txn| Ok(txn.remote_documents.size()))
            .unwrap();
        assert_eq!(size, 0);
    }

    #[test]
    fn primary_transactions_require_the_lease() {
        let persistence = started();
        persistence.set_primary(false);
        let persistence: &dyn Persistence = &persistence;
        let error = persistence
            .run("primary", TransactionMode::ReadWritePrimary, |_| Ok(()))
            .unwrap_err();
        assert!(error.is_primary_lease_lost());
        assert_eq!(error.code, FirestoreErrorCode::FailedPrecondition);
    }

    #[test]
    fn unreferenced_documents_are_collected_on_commit() {
        let persistence = started();
        let persistence: &dyn Persistence = &persistence;
        let key = DocumentKey::from_string("c/a").unwrap();
        persistence
            .run("add", TransactionMode::ReadWrite, |txn| {
                txn.remote_documents
                    .add_entry(doc("c/a"), SnapshotVersion::new(Timestamp::new(1, 0)))?;
                txn.references.remove_mutation_reference(&key);
                Ok(())
            })
            .unwrap();
        let size = persistence
            .run("read", TransactionMode::ReadOnly, |txn| Ok(txn.remote_documents.size()))
            .unwrap();
        assert_eq!(size, 0);
    }
}
