use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use crate::firestore::error::FirestoreError;
use crate::firestore::model::{BatchId, TargetId};
use crate::firestore::remote::{OnlineState, User};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationBatchState {
    Pending,
    Acknowledged,
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryTargetState {
    NotCurrent,
    Current,
    Rejected,
}

/// State shared between the clients of one persistence instance: which
/// client is primary, the pending writes, and the query targets each client
/// listens to.
pub trait SharedClientState: Send + Sync {
    /// Whether this client owns the network connection.
    fn is_primary_client(&self) -> bool;

    fn add_pending_mutation(&self, batch_id: BatchId);

    fn update_mutation_state(&self, batch_id: BatchId, state: MutationBatchState, error: Option<&FirestoreError>);

    /// Registers the target for this client and returns the state the
    /// clients last recorded for it.
    fn add_local_query_target(&self, target_id: TargetId, add_to_active_targets: bool) -> QueryTargetState;

    fn update_query_state(&self, target_id: TargetId, state: QueryTargetState, error: Option<&FirestoreError>);

    fn remove_local_query_target(&self, target_id: TargetId);

    fn is_local_query_target(&self, target_id: TargetId) -> bool;

    /// Whether any client still listens to the target.
    fn is_active_query_target(&self, target_id: TargetId) -> bool;

    fn clear_query_state(&self, target_id: TargetId);

    fn handle_user_change(&self, user: &User, removed_batch_ids: &[BatchId], added_batch_ids: &[BatchId]);

    fn set_online_state(&self, online_state: OnlineState);
}

#[derive(Default)]
struct MemoryClientState {
    active_targets: BTreeSet<TargetId>,
    query_states: BTreeMap<TargetId, QueryTargetState>,
    mutation_states: BTreeMap<BatchId, MutationBatchState>,
    online_state: Option<OnlineState>,
}

/// Single-client implementation: the client is always primary and nothing
/// is shared.
#[derive(Default)]
pub struct MemorySharedClientState {
    state: Mutex<MemoryClientState>,
}

impl MemorySharedClientState {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryClientState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn mutation_state(&self, batch_id: BatchId) -> Option<MutationBatchState> {
        self.state().mutation_states.get(&batch_id).copied()
    }

    pub fn query_state(&self, target_id: TargetId) -> Option<QueryTargetState> {
        self.state().query_states.get(&target_id).copied()
    }

    pub fn online_state(&self) -> Option<OnlineState> {
        self.state().online_state
    }
}

impl SharedClientState for MemorySharedClientState {
    fn is_primary_client(&self) -> bool {
        true
    }

    fn add_pending_mutation(&self, batch_id: BatchId) {
        self.state().mutation_states.insert(batch_id, MutationBatchState::Pending);
    }

    fn update_mutation_state(&self, batch_id: BatchId, state: MutationBatchState, error: Option<&FirestoreError>) {
        if let Some(error) = error {
            log::debug!("shared client state: batch {batch_id} rejected: {error}");
        }
        let mut client = self.state();
        match state {
            // Finished batches are not tracked by a single client.
            MutationBatchState::Acknowledged | MutationBatchState::Rejected => {
                client.mutation_states.remove(&batch_id);
            }
            MutationBatchState::Pending => {
                client.mutation_states.insert(batch_id, state);
            }
        }
    }

    fn add_local_query_target(&self, target_id: TargetId, add_to_active_targets: bool) -> QueryTargetState {
        let mut client = self.state();
        if add_to_active_targets {
            client.active_targets.insert(target_id);
        }
        client
            .query_states
            .get(&target_id)
            .copied()
            .unwrap_or(QueryTargetState::NotCurrent)
    }

    fn update_query_state(&self, target_id: TargetId, state: QueryTargetState, error: Option<&FirestoreError>) {
        if let Some(error) = error {
            log::debug!("shared client state: target {target_id} rejected: {error}");
        }
        self.state().query_states.insert(target_id, state);
    }

    fn remove_local_query_target(&self, target_id: TargetId) {
        self.state().active_targets.remove(&target_id);
    }

    fn is_local_query_target(&self, target_id: TargetId) -> bool {
        self.state().active_targets.contains(&target_id)
    }

    fn is_active_query_target(&self, target_id: TargetId) -> bool {
        self.state().active_targets.contains(&target_id)
    }

    fn clear_query_state(&self, target_id: TargetId) {
        self.state().query_states.remove(&target_id);
    }

    fn handle_user_change(&self, _user: &User, removed_batch_ids: &[BatchId], added_batch_ids: &[BatchId]) {
        let mut client = self.state();
        for batch_id in removed_batch_ids {
            client.mutation_states.remove(batch_id);
        }
        for batch_id in added_batch_ids {
            client.mutation_states.insert(*batch_id, MutationBatchState::Pending);
        }
    }

    fn set_online_state(&self, online_state: OnlineState) {
        self.state().online_state = Some(online_state);
    }
}
