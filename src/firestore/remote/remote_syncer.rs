use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{BatchId, DocumentKey, MutationBatchResult, TargetId};
use crate::firestore::remote::credentials::User;
use crate::firestore::remote::online_state_tracker::OnlineState;
use crate::firestore::remote::remote_event::RemoteEvent;

/// Callbacks the remote store makes into the sync engine.
///
/// Every async method runs on the async queue.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies one consistent snapshot from the watch stream.
    async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()>;

    /// The backend refused to listen to `target_id`; the target is already
    /// forgotten by the remote store.
    async fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()>;

    async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()>;

    /// The batch failed with a permanent error and will not be retried.
    async fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()>;

    /// Keys of the documents the backend last reported for the target.
    /// Called while watch changes are aggregated, so it must not block on
    /// the async queue.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    async fn handle_credential_change(&self, user: User) -> FirestoreResult<()>;

    async fn apply_online_state_change(&self, online_state: OnlineState) -> FirestoreResult<()>;
}
