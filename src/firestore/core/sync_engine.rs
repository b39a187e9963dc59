use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::channel::oneshot;

use crate::firestore::core::view::{LimboDocumentChange, View, ViewChange};
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::core::{Query, Target, TargetIdGenerator};
use crate::firestore::error::{cancelled, internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::{
    ignore_if_primary_lease_loss, LocalStore, LocalViewChanges, MutationBatchState, QueryTargetState,
    ReferenceSet, SharedClientState, TargetData, TargetPurpose,
};
use crate::firestore::model::{
    BatchId, DocumentKey, MutableDocument, Mutation, MutationBatchResult, SnapshotVersion, TargetId,
    BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::{OnlineState, RemoteEvent, RemoteStore, RemoteSyncer, TargetChange, User};

/// Sequence number of targets that are never persisted.
const INVALID_SEQUENCE_NUMBER: i64 = -1;

/// Resolves once the batch is acknowledged or rejected by the backend.
pub type WriteCompletion = oneshot::Receiver<FirestoreResult<()>>;

/// Receives what the sync engine produces for query listeners.
pub trait SyncEngineListener: Send + Sync {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);

    /// The backend rejected the target of `query`; the query is gone from
    /// the sync engine.
    fn on_watch_error(&self, query: &Query, error: &FirestoreError);

    fn on_online_state_change(&self, online_state: OnlineState);
}

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// Whether the limbo target has reported the document. A target that
    /// turns current without it resolves the key as deleted.
    received_document: bool,
}

/// Remote store calls decided while the engine state was locked.
#[derive(Default)]
struct LimboWork {
    listen: Vec<TargetData>,
    unlisten: Vec<TargetId>,
}

/// Limbo documents and the single-document targets resolving them.
struct LimboTracker {
    max_concurrent: usize,
    id_generator: TargetIdGenerator,
    enqueued: VecDeque<DocumentKey>,
    active_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which query targets hold each key in limbo.
    document_refs: ReferenceSet,
}

impl LimboTracker {
    fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            id_generator: TargetIdGenerator::for_sync_engine(),
            enqueued: VecDeque::new(),
            active_targets_by_key: BTreeMap::new(),
            active_resolutions_by_target: BTreeMap::new(),
            document_refs: ReferenceSet::new(),
        }
    }

    fn update(&mut self, target_id: TargetId, changes: Vec<LimboDocumentChange>, work: &mut LimboWork) {
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.document_refs.add_reference(key.clone(), target_id);
                    self.track(key, work);
                }
                LimboDocumentChange::Removed(key) => {
                    self.document_refs.remove_reference(&key, target_id);
                    if !self.document_refs.contains_key(&key) {
                        self.remove_limbo_target(&key, work);
                    }
                }
            }
        }
    }

    fn track(&mut self, key: DocumentKey, work: &mut LimboWork) {
        if !self.active_targets_by_key.contains_key(&key) && !self.enqueued.contains(&key) {
            log::debug!("sync engine: new document in limbo: {key}");
            self.enqueued.push_back(key);
            self.pump(work);
        }
    }

    /// Starts limbo targets for queued keys while under the concurrency cap.
    fn pump(&mut self, work: &mut LimboWork) {
        while self.active_targets_by_key.len() < self.max_concurrent {
            let Some(key) = self.enqueued.pop_front() else {
                break;
            };
            let target_id = self.id_generator.next();
            self.active_resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_targets_by_key.insert(key.clone(), target_id);
            work.listen.push(TargetData::new(
                Target::for_document(&key),
                target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            ));
        }
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey, work: &mut LimboWork) {
        self.enqueued.retain(|queued| queued != key);
        let Some(target_id) = self.active_targets_by_key.remove(key) else {
            return;
        };
        self.active_resolutions_by_target.remove(&target_id);
        work.unlisten.push(target_id);
        self.pump(work);
    }

    fn remove_references_for_target(&mut self, target_id: TargetId, work: &mut LimboWork) {
        for key in self.document_refs.remove_references_for_id(target_id) {
            if !self.document_refs.contains_key(&key) {
                self.remove_limbo_target(&key, work);
            }
        }
    }

    /// Drops every limbo target without telling the remote store.
    fn reset(&mut self) -> Vec<TargetId> {
        let targets = self.active_resolutions_by_target.keys().copied().collect();
        self.enqueued.clear();
        self.active_targets_by_key.clear();
        self.active_resolutions_by_target.clear();
        self.document_refs.remove_all_references();
        targets
    }
}

struct SyncEngineState {
    /// Views by query canonical id.
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    limbo: LimboTracker,
    mutation_callbacks: HashMap<User, BTreeMap<BatchId, oneshot::Sender<FirestoreResult<()>>>>,
    /// Callbacks of `wait_for_pending_writes`, keyed by the highest batch
    /// pending when they were registered.
    pending_writes_callbacks: BTreeMap<BatchId, Vec<oneshot::Sender<FirestoreResult<()>>>>,
    current_user: User,
    online_state: OnlineState,
}

/// Ties the local store, the remote store and the views together.
///
/// The engine owns the query views and their targets, resolves limbo
/// documents, and routes local writes and remote events to the views. Every
/// async method must run on the async queue.
pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    shared_client_state: Arc<dyn SharedClientState>,
    is_primary: AtomicBool,
    listener: Mutex<Option<Weak<dyn SyncEngineListener>>>,
    state: Mutex<SyncEngineState>,
}

impl SyncEngine {
    /// Creates the engine and attaches it to `remote_store` as its syncer.
    pub fn new(
        local_store: Arc<LocalStore>,
        remote_store: RemoteStore,
        shared_client_state: Arc<dyn SharedClientState>,
        max_concurrent_limbo_resolutions: usize,
    ) -> Arc<Self> {
        let current_user = User {
            uid: local_store.current_user(),
        };
        let engine = Arc::new(Self {
            is_primary: AtomicBool::new(shared_client_state.is_primary_client()),
            local_store,
            remote_store,
            shared_client_state,
            listener: Mutex::new(None),
            state: Mutex::new(SyncEngineState {
                query_views: BTreeMap::new(),
                queries_by_target: BTreeMap::new(),
                limbo: LimboTracker::new(max_concurrent_limbo_resolutions),
                mutation_callbacks: HashMap::new(),
                pending_writes_callbacks: BTreeMap::new(),
                current_user,
                online_state: OnlineState::Unknown,
            }),
        });
        let syncer: Weak<dyn RemoteSyncer> = Arc::downgrade(&engine) as Weak<dyn RemoteSyncer>;
        engine.remote_store.set_syncer(syncer);
        engine
    }

    pub fn set_listener(&self, listener: Weak<dyn SyncEngineListener>) {
        *self.listener.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(listener);
    }

    fn listener(&self) -> Option<Arc<dyn SyncEngineListener>> {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn state(&self) -> MutexGuard<'_, SyncEngineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local_store
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    pub fn is_primary_client(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    pub fn online_state(&self) -> OnlineState {
        self.state().online_state
    }

    /// Keys with an active limbo target, and the target ids.
    pub fn active_limbo_document_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.state().limbo.active_targets_by_key.clone()
    }

    /// Keys waiting for a free limbo resolution slot, oldest first.
    pub fn enqueued_limbo_document_resolutions(&self) -> Vec<DocumentKey> {
        self.state().limbo.enqueued.iter().cloned().collect()
    }

    /// Starts listening to `query` and returns its first snapshot. A query
    /// that already has a view shares it.
    pub async fn listen(&self, query: &Query, should_listen_to_remote: bool) -> FirestoreResult<ViewSnapshot> {
        let canonical_id = query.canonical_id();
        let existing = {
            let state = self.state();
            state
                .query_views
                .get(&canonical_id)
                .map(|query_view| (query_view.target_id, query_view.view.compute_initial_snapshot()))
        };
        if let Some((target_id, snapshot)) = existing {
            self.shared_client_state.add_local_query_target(target_id, true);
            return Ok(snapshot);
        }

        let target_data = self.local_store.allocate_target(query.to_target())?;
        let target_id = target_data.target_id;
        let status = self
            .shared_client_state
            .add_local_query_target(target_id, should_listen_to_remote);
        let (snapshot, work) = self.initialize_view_and_compute_snapshot(
            query,
            target_id,
            status == QueryTargetState::Current,
            target_data.resume_token.clone(),
        )?;

        if self.is_primary_client() && should_listen_to_remote {
            self.remote_store.listen(target_data).await?;
        }
        self.apply_limbo_work(work).await?;
        Ok(snapshot)
    }

    fn initialize_view_and_compute_snapshot(
        &self,
        query: &Query,
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
    ) -> FirestoreResult<(ViewSnapshot, LimboWork)> {
        let query_result = self.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), query_result.remote_keys.clone());
        let docs: BTreeMap<DocumentKey, MutableDocument> = query_result
            .documents
            .into_iter()
            .map(|doc| (doc.key().clone(), doc))
            .collect();
        let doc_changes = view.compute_doc_changes(&docs, None);

        let mut state = self.state();
        let synthesized = TargetChange::synthesized_for_current_change(
            current && state.online_state != OnlineState::Offline,
            resume_token,
        );
        let view_change = view.apply_changes(doc_changes, self.is_primary_client(), Some(&synthesized), false);

        let mut work = LimboWork::default();
        state.limbo.update(target_id, view_change.limbo_changes, &mut work);
        state.query_views.insert(
            query.canonical_id(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        state.queries_by_target.entry(target_id).or_default().push(query.clone());

        let snapshot = view_change
            .snapshot
            .ok_or_else(|| internal_error("A new view did not produce a snapshot"))?;
        Ok((snapshot, work))
    }

    /// Stops listening to `query`. The target is released once no other
    /// query uses it.
    pub async fn unlisten(&self, query: &Query, should_unlisten_remote: bool) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let target_id = {
            let mut state = self.state();
            let Some(target_id) = state.query_views.get(&canonical_id).map(|view| view.target_id) else {
                return Err(internal_error(format!(
                    "Trying to unlisten on query not found: {canonical_id}"
                )));
            };
            let queries = state.queries_by_target.entry(target_id).or_default();
            if queries.len() > 1 {
                queries.retain(|other| other != query);
                state.query_views.remove(&canonical_id);
                return Ok(());
            }
            target_id
        };

        if self.is_primary_client() {
            self.shared_client_state.remove_local_query_target(target_id);
            if self.shared_client_state.is_active_query_target(target_id) {
                return Ok(());
            }
            let released = ignore_if_primary_lease_loss(self.local_store.release_target(target_id, false))?;
            if released.is_some() {
                self.shared_client_state.clear_query_state(target_id);
                if should_unlisten_remote {
                    self.remote_store.unlisten(target_id).await?;
                }
                self.remove_and_clean_up_target(target_id, None).await?;
            }
            Ok(())
        } else {
            self.remove_and_clean_up_target(target_id, None).await?;
            self.local_store.release_target(target_id, true)
        }
    }

    /// Starts watching the target of `query`, whose view so far only
    /// served the cache.
    pub async fn listen_to_remote_store(&self, query: &Query) -> FirestoreResult<()> {
        let target_data = self.local_store.allocate_target(query.to_target())?;
        self.shared_client_state
            .add_local_query_target(target_data.target_id, true);
        if self.is_primary_client() {
            self.remote_store.listen(target_data).await?;
        }
        Ok(())
    }

    /// Stops watching the target of `query` while keeping its view.
    pub async fn unlisten_from_remote_store(&self, query: &Query) -> FirestoreResult<()> {
        let target = {
            let state = self.state();
            state.query_views.get(&query.canonical_id()).map(|query_view| {
                let shared = state
                    .queries_by_target
                    .get(&query_view.target_id)
                    .is_some_and(|queries| queries.len() > 1);
                (query_view.target_id, shared)
            })
        };
        let Some((target_id, shared)) = target else {
            return Ok(());
        };
        if self.is_primary_client() && !shared {
            self.shared_client_state.remove_local_query_target(target_id);
            self.remote_store.unlisten(target_id).await?;
        }
        Ok(())
    }

    async fn remove_and_clean_up_target(
        &self,
        target_id: TargetId,
        error: Option<&FirestoreError>,
    ) -> FirestoreResult<()> {
        self.shared_client_state.remove_local_query_target(target_id);
        let mut work = LimboWork::default();
        let queries = {
            let mut state = self.state();
            let queries = state.queries_by_target.remove(&target_id).unwrap_or_default();
            for query in &queries {
                state.query_views.remove(&query.canonical_id());
            }
            if self.is_primary_client() {
                state.limbo.remove_references_for_target(target_id, &mut work);
            }
            queries
        };

        if let (Some(error), Some(listener)) = (error, self.listener()) {
            for query in &queries {
                listener.on_watch_error(query, error);
            }
        }
        self.apply_limbo_work(work).await
    }

    /// Applies `mutations` locally, raises the optimistic snapshots and
    /// hands the batch to the write pipeline.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteCompletion> {
        let result = self.local_store.write_locally(mutations)?;
        self.shared_client_state.add_pending_mutation(result.batch_id);

        let (sender, receiver) = oneshot::channel();
        {
            let mut state = self.state();
            let user = state.current_user.clone();
            state
                .mutation_callbacks
                .entry(user)
                .or_default()
                .insert(result.batch_id, sender);
        }

        self.emit_new_snaps_and_notify_local_store(&result.changes, None).await?;
        self.remote_store.fill_write_pipeline().await?;
        Ok(receiver)
    }

    /// Resolves once every write pending now is acknowledged or rejected.
    pub fn register_pending_writes_callback(&self) -> FirestoreResult<WriteCompletion> {
        if !self.remote_store.can_use_network() {
            log::debug!(
                "sync engine: the network is disabled; pending writes complete once it is enabled again"
            );
        }
        let (sender, receiver) = oneshot::channel();
        let highest_batch_id = self.local_store.get_highest_unacknowledged_batch_id()?;
        if highest_batch_id == BATCH_ID_UNKNOWN {
            let _ = sender.send(Ok(()));
        } else {
            self.state()
                .pending_writes_callbacks
                .entry(highest_batch_id)
                .or_default()
                .push(sender);
        }
        Ok(receiver)
    }

    fn process_user_callback(&self, batch_id: BatchId, result: FirestoreResult<()>) {
        let sender = {
            let mut state = self.state();
            let user = state.current_user.clone();
            state
                .mutation_callbacks
                .get_mut(&user)
                .and_then(|callbacks| callbacks.remove(&batch_id))
        };
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
    }

    fn trigger_pending_writes_callbacks(&self, batch_id: BatchId) {
        let callbacks = self.state().pending_writes_callbacks.remove(&batch_id);
        for callback in callbacks.into_iter().flatten() {
            let _ = callback.send(Ok(()));
        }
    }

    fn reject_outstanding_pending_writes_callbacks(&self, message: &str) {
        let callbacks = std::mem::take(&mut self.state().pending_writes_callbacks);
        for callback in callbacks.into_values().flatten() {
            let _ = callback.send(Err(cancelled(message)));
        }
    }

    fn reject_mutation_callbacks_for_user(&self, user: &User, message: &str) {
        let callbacks = self.state().mutation_callbacks.remove(user);
        for callback in callbacks.into_iter().flat_map(BTreeMap::into_values) {
            let _ = callback.send(Err(cancelled(message)));
        }
    }

    /// Recomputes every view for `changes`, raises the new snapshots and
    /// tells the local store which documents the views now show.
    async fn emit_new_snaps_and_notify_local_store(
        &self,
        changes: &BTreeMap<DocumentKey, MutableDocument>,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let is_primary = self.is_primary_client();
        let mut snapshots = Vec::new();
        let mut local_view_changes = Vec::new();
        let mut work = LimboWork::default();
        {
            let mut guard = self.state();
            let state = &mut *guard;
            for query_view in state.query_views.values_mut() {
                let mut doc_changes = query_view.view.compute_doc_changes(changes, None);
                if doc_changes.needs_refill {
                    // A limited query lost a document; documents beyond the
                    // old window may take its place.
                    let result = self.local_store.execute_query(&query_view.query, false)?;
                    let docs: BTreeMap<DocumentKey, MutableDocument> = result
                        .documents
                        .into_iter()
                        .map(|doc| (doc.key().clone(), doc))
                        .collect();
                    doc_changes = query_view.view.compute_doc_changes(&docs, Some(doc_changes));
                }

                let target_id = query_view.target_id;
                let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
                let pending_reset =
                    remote_event.is_some_and(|event| event.target_mismatches.contains_key(&target_id));
                let ViewChange {
                    snapshot,
                    limbo_changes,
                } = query_view
                    .view
                    .apply_changes(doc_changes, is_primary, target_change, pending_reset);
                state.limbo.update(target_id, limbo_changes, &mut work);

                if let Some(snapshot) = snapshot {
                    if is_primary {
                        let query_state = if snapshot.from_cache {
                            QueryTargetState::NotCurrent
                        } else {
                            QueryTargetState::Current
                        };
                        self.shared_client_state.update_query_state(target_id, query_state, None);
                    }
                    local_view_changes.push(local_view_changes_from_snapshot(target_id, &snapshot));
                    snapshots.push(snapshot);
                }
            }
        }

        if !snapshots.is_empty() {
            if let Some(listener) = self.listener() {
                listener.on_watch_change(snapshots);
            }
        }
        ignore_if_primary_lease_loss(self.local_store.notify_local_view_changes(&local_view_changes))?;
        self.apply_limbo_work(work).await
    }

    async fn apply_limbo_work(&self, work: LimboWork) -> FirestoreResult<()> {
        for target_id in work.unlisten {
            self.remote_store.unlisten(target_id).await?;
        }
        for target_data in work.listen {
            self.remote_store.listen(target_data).await?;
        }
        Ok(())
    }

    /// Switches between primary and secondary. A new primary rebuilds its
    /// views from the persisted target state and takes over the network.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        if self.is_primary.swap(is_primary, Ordering::SeqCst) == is_primary {
            return Ok(());
        }
        log::debug!("sync engine: primary state changed to {is_primary}");

        if !is_primary {
            let limbo_targets = self.state().limbo.reset();
            for target_id in limbo_targets {
                self.remote_store.unlisten(target_id).await?;
            }
            return self.remote_store.apply_primary_state(false).await;
        }

        let mut snapshots = Vec::new();
        let mut work = LimboWork::default();
        let mut targets = Vec::new();
        {
            let mut guard = self.state();
            let state = &mut *guard;
            for query_view in state.query_views.values_mut() {
                let query_result = self.local_store.execute_query(&query_view.query, true)?;
                let view_change = query_view.view.synchronize_with_persisted_remote_keys(&query_result);
                state
                    .limbo
                    .update(query_view.target_id, view_change.limbo_changes, &mut work);
                if let Some(snapshot) = view_change.snapshot {
                    snapshots.push(snapshot);
                }
                if let Some(target_data) = self.local_store.get_local_target_data(&query_view.query.to_target()) {
                    targets.push(target_data);
                }
            }
        }

        if !snapshots.is_empty() {
            if let Some(listener) = self.listener() {
                listener.on_watch_change(snapshots);
            }
        }
        self.remote_store.apply_primary_state(true).await?;
        for target_data in targets {
            self.remote_store.listen(target_data).await?;
        }
        self.apply_limbo_work(work).await
    }

    /// Checks that limbo targets report at most their one document and
    /// records whether they have it.
    fn track_limbo_target_changes(&self, event: &RemoteEvent) -> FirestoreResult<()> {
        let mut state = self.state();
        for (target_id, change) in &event.target_changes {
            let Some(resolution) = state.limbo.active_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            let changed = change.added_documents.len()
                + change.modified_documents.len()
                + change.removed_documents.len();
            if changed > 1 {
                return Err(internal_error(
                    "Limbo resolution for single document contains multiple changes.",
                ));
            }
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.modified_documents.is_empty() {
                if !resolution.received_document {
                    return Err(internal_error("Received change for limbo target document without add."));
                }
            } else if !change.removed_documents.is_empty() {
                if !resolution.received_document {
                    return Err(internal_error("Received remove for limbo target document without add."));
                }
                resolution.received_document = false;
            }
        }
        Ok(())
    }
}

fn local_view_changes_from_snapshot(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut added_keys = BTreeSet::new();
    let mut removed_keys = BTreeSet::new();
    for change in &snapshot.doc_changes {
        match change.change_type {
            ChangeType::Added => {
                added_keys.insert(change.doc.key().clone());
            }
            ChangeType::Removed => {
                removed_keys.insert(change.doc.key().clone());
            }
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        added_keys,
        removed_keys,
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl RemoteSyncer for SyncEngine {
    async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()> {
        self.track_limbo_target_changes(&event)?;
        let Some(changes) = ignore_if_primary_lease_loss(self.local_store.apply_remote_event(&event))? else {
            return Ok(());
        };
        self.emit_new_snaps_and_notify_local_store(&changes, Some(&event)).await
    }

    async fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        let limbo_key = self
            .state()
            .limbo
            .active_resolutions_by_target
            .get(&target_id)
            .map(|resolution| resolution.key.clone());

        if let Some(key) = limbo_key {
            log::debug!("sync engine: limbo resolution for {key} rejected: {error}");
            // The document is treated as deleted so the views drop it.
            let mut event = RemoteEvent::new(SnapshotVersion::min());
            event
                .document_updates
                .insert(key.clone(), MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()));
            event.resolved_limbo_documents.insert(key.clone());
            self.apply_remote_event(event).await?;

            let mut work = LimboWork::default();
            {
                let mut state = self.state();
                state.limbo.active_targets_by_key.remove(&key);
                state.limbo.active_resolutions_by_target.remove(&target_id);
                state.limbo.pump(&mut work);
            }
            return self.apply_limbo_work(work).await;
        }

        self.shared_client_state
            .update_query_state(target_id, QueryTargetState::Rejected, Some(&error));
        if ignore_if_primary_lease_loss(self.local_store.release_target(target_id, false))?.is_some() {
            self.remove_and_clean_up_target(target_id, Some(&error)).await?;
        }
        Ok(())
    }

    async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let Some(changes) = ignore_if_primary_lease_loss(self.local_store.acknowledge_batch(&result))? else {
            return Ok(());
        };
        self.process_user_callback(batch_id, Ok(()));
        self.trigger_pending_writes_callbacks(batch_id);
        self.shared_client_state
            .update_mutation_state(batch_id, MutationBatchState::Acknowledged, None);
        self.emit_new_snaps_and_notify_local_store(&changes, None).await
    }

    async fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        let Some(changes) = ignore_if_primary_lease_loss(self.local_store.reject_batch(batch_id))? else {
            return Ok(());
        };
        self.process_user_callback(batch_id, Err(error.clone()));
        self.trigger_pending_writes_callbacks(batch_id);
        self.shared_client_state
            .update_mutation_state(batch_id, MutationBatchState::Rejected, Some(&error));
        self.emit_new_snaps_and_notify_local_store(&changes, None).await
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        let state = self.state();
        if let Some(resolution) = state.limbo.active_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                return BTreeSet::from([resolution.key.clone()]);
            }
        }
        let mut keys = BTreeSet::new();
        for query in state.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = state.query_views.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }

    async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        if self.state().current_user == user {
            return Ok(());
        }
        log::debug!("sync engine: user changed to {:?}", user.uid);
        let result = self.local_store.handle_user_change(user.uid.clone())?;
        let previous_user = std::mem::replace(&mut self.state().current_user, user.clone());

        self.reject_mutation_callbacks_for_user(&previous_user, "The write was cancelled because the user changed.");
        self.reject_outstanding_pending_writes_callbacks(
            "'wait_for_pending_writes' was cancelled because the user changed.",
        );
        self.shared_client_state
            .handle_user_change(&user, &result.removed_batch_ids, &result.added_batch_ids);
        self.emit_new_snaps_and_notify_local_store(&result.affected_documents, None)
            .await
    }

    async fn apply_online_state_change(&self, online_state: OnlineState) -> FirestoreResult<()> {
        if !self.is_primary_client() {
            return Ok(());
        }
        let snapshots: Vec<ViewSnapshot> = {
            let mut state = self.state();
            state.online_state = online_state;
            state
                .query_views
                .values_mut()
                .filter_map(|query_view| query_view.view.apply_online_state_change(online_state).snapshot)
                .collect()
        };

        if let Some(listener) = self.listener() {
            listener.on_online_state_change(online_state);
            if !snapshots.is_empty() {
                listener.on_watch_change(snapshots);
            }
        }
        self.shared_client_state.set_online_state(online_state);
        Ok(())
    }
}
