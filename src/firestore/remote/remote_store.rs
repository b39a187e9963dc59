use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::{LocalStore, TargetData};
use crate::firestore::model::{
    DatabaseId, DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion, TargetId,
};
use crate::firestore::remote::credentials::User;
use crate::firestore::remote::online_state_tracker::{OnlineState, OnlineStateHandler, OnlineStateTracker};
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::serializer::{JsonProtoSerializer, WriteResponse};
use crate::firestore::remote::stream::StreamContext;
use crate::firestore::remote::streams::{ListenStream, ListenStreamDelegate, WriteStream, WriteStreamDelegate};
use crate::firestore::remote::watch_change::{TargetChangeState, WatchChange};
use crate::firestore::remote::watch_change_aggregator::{
    ExistenceFilterMismatchInfo, TargetMetadataProvider, WatchChangeAggregator,
};
use crate::firestore::util::AsyncQueue;

/// Reasons the network is disabled. The streams only run while the set is
/// empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    /// Local persistence failed; cleared once a probe read succeeds again.
    PersistenceFailure,
    IsSecondary,
    CredentialChange,
    ConnectivityChange,
    Shutdown,
}

type ListenTargets = Arc<Mutex<BTreeMap<TargetId, TargetData>>>;
type SyncerSlot = Arc<Mutex<Option<Weak<dyn RemoteSyncer>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn upgrade_syncer(slot: &SyncerSlot) -> Option<Arc<dyn RemoteSyncer>> {
    lock(slot).as_ref().and_then(Weak::upgrade)
}

struct RemoteStoreState {
    /// Batches sent (or about to be sent) on the write stream, oldest first.
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
    /// Present while the watch stream is started.
    watch_change_aggregator: Option<WatchChangeAggregator>,
    last_existence_filter_mismatch: Option<ExistenceFilterMismatchInfo>,
}

struct RemoteStoreInner {
    local_store: Arc<LocalStore>,
    queue: AsyncQueue,
    database_id: DatabaseId,
    max_pending_writes: usize,
    listen_targets: ListenTargets,
    syncer: SyncerSlot,
    watch_stream: ListenStream,
    write_stream: WriteStream,
    online_state_tracker: OnlineStateTracker,
    state: Mutex<RemoteStoreState>,
}

/// Owns the watch and write streams and keeps them in line with what the
/// sync engine needs: the listened targets and the queued mutation batches.
///
/// Every async method must run on the async queue.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

impl RemoteStore {
    pub fn new(local_store: Arc<LocalStore>, context: StreamContext) -> Self {
        let serializer = Arc::new(JsonProtoSerializer::new(context.database_id.clone()));
        let syncer: SyncerSlot = Arc::new(Mutex::new(None));

        let handler_slot = Arc::clone(&syncer);
        let online_state_handler: OnlineStateHandler = Arc::new(move |online_state| {
            let syncer = upgrade_syncer(&handler_slot);
            async move {
                if let Some(syncer) = syncer {
                    if let Err(error) = syncer.apply_online_state_change(online_state).await {
                        log::warn!("remote store: applying online state {online_state:?} failed: {error}");
                    }
                }
            }
            .boxed()
        });

        let inner = Arc::new_cyclic(|weak: &Weak<RemoteStoreInner>| {
            let watch_stream = ListenStream::new(
                context.clone(),
                Arc::clone(&serializer),
                Arc::new(RemoteListenDelegate { store: weak.clone() }),
            );
            let write_stream = WriteStream::new(
                context.clone(),
                Arc::clone(&serializer),
                Arc::new(RemoteWriteDelegate { store: weak.clone() }),
            );
            RemoteStoreInner {
                local_store,
                queue: context.queue.clone(),
                database_id: context.database_id.clone(),
                max_pending_writes: context.settings.max_pending_writes(),
                listen_targets: Arc::new(Mutex::new(BTreeMap::new())),
                syncer,
                watch_stream,
                write_stream,
                online_state_tracker: OnlineStateTracker::new(
                    context.queue.clone(),
                    context.settings.online_state_timeout(),
                    online_state_handler,
                ),
                state: Mutex::new(RemoteStoreState {
                    write_pipeline: VecDeque::new(),
                    offline_causes: BTreeSet::new(),
                    watch_change_aggregator: None,
                    last_existence_filter_mismatch: None,
                }),
            }
        });
        Self { inner }
    }

    fn from_weak(weak: &Weak<RemoteStoreInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn state(&self) -> MutexGuard<'_, RemoteStoreState> {
        lock(&self.inner.state)
    }

    /// Attaches the sync engine. The store only keeps a weak reference.
    pub fn set_syncer(&self, syncer: Weak<dyn RemoteSyncer>) {
        *lock(&self.inner.syncer) = Some(syncer);
    }

    fn syncer(&self) -> FirestoreResult<Arc<dyn RemoteSyncer>> {
        upgrade_syncer(&self.inner.syncer)
            .ok_or_else(|| internal_error("RemoteStore used without an attached sync engine"))
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.online_state_tracker.state()
    }

    pub fn can_use_network(&self) -> bool {
        self.state().offline_causes.is_empty()
    }

    pub fn listen_target_ids(&self) -> Vec<TargetId> {
        lock(&self.inner.listen_targets).keys().copied().collect()
    }

    pub fn write_pipeline_len(&self) -> usize {
        self.state().write_pipeline.len()
    }

    /// Most recent existence filter that disagreed with the local count.
    pub fn last_existence_filter_mismatch(&self) -> Option<ExistenceFilterMismatchInfo> {
        self.state().last_existence_filter_mismatch.clone()
    }

    pub async fn start(&self) -> FirestoreResult<()> {
        self.enable_network().await
    }

    /// Re-enables the network after [`disable_network`](Self::disable_network).
    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.state().offline_causes.remove(&OfflineCause::UserDisabled);
        self.enable_network_internal().await
    }

    fn enable_network_internal(&self) -> BoxFuture<'static, FirestoreResult<()>> {
        let store = self.clone();
        async move {
            if !store.can_use_network() {
                return Ok(());
            }
            match store.inner.local_store.get_last_stream_token() {
                Ok(token) => store.inner.write_stream.set_last_stream_token(token),
                Err(error) => return store.disable_network_until_recovery(error).await,
            }
            store.fill_write_pipeline().await?;
            if store.should_start_watch_stream() {
                store.start_watch_stream().await;
            } else {
                store.inner.online_state_tracker.set(OnlineState::Unknown).await;
            }
            Ok(())
        }
        .boxed()
    }

    /// Stops both streams and reports the client offline. Listen targets and
    /// queued writes survive and are resent once the network is enabled.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.state().offline_causes.insert(OfflineCause::UserDisabled);
        self.disable_network_internal().await;
        self.inner.online_state_tracker.set(OnlineState::Offline).await;
        Ok(())
    }

    async fn disable_network_internal(&self) {
        self.inner.write_stream.stop().await;
        self.inner.watch_stream.stop().await;

        let dropped = {
            let mut state = self.state();
            let dropped = state.write_pipeline.len();
            state.write_pipeline.clear();
            dropped
        };
        if dropped > 0 {
            log::debug!("remote store: stopping write stream with {dropped} pending writes");
        }
        self.clean_up_watch_stream_state();
    }

    pub async fn shutdown(&self) -> FirestoreResult<()> {
        log::debug!("remote store: shutting down");
        self.state().offline_causes.insert(OfflineCause::Shutdown);
        self.disable_network_internal().await;
        // Offline would make listeners raise snapshots from cache.
        self.inner.online_state_tracker.set(OnlineState::Unknown).await;
        Ok(())
    }

    /// Starts listening to `target_data`; a no-op for a target already
    /// listened to.
    pub async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        let target_id = target_data.target_id;
        {
            let mut targets = lock(&self.inner.listen_targets);
            if targets.contains_key(&target_id) {
                return Ok(());
            }
            targets.insert(target_id, target_data.clone());
        }

        if self.should_start_watch_stream() {
            self.start_watch_stream().await;
        } else if self.inner.watch_stream.is_open() {
            self.send_watch_request(target_data).await?;
        }
        Ok(())
    }

    pub async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        let now_empty = {
            let mut targets = lock(&self.inner.listen_targets);
            targets.remove(&target_id);
            targets.is_empty()
        };
        if self.inner.watch_stream.is_open() {
            self.send_unwatch_request(target_id).await?;
        }

        if now_empty {
            if self.inner.watch_stream.is_open() {
                self.inner.watch_stream.mark_idle();
            } else if self.can_use_network() {
                // No stream and no targets: nothing can prove we are online
                // or offline.
                self.inner.online_state_tracker.set(OnlineState::Unknown).await;
            }
        }
        Ok(())
    }

    async fn send_watch_request(&self, target_data: TargetData) -> FirestoreResult<()> {
        let target_id = target_data.target_id;
        if let Some(aggregator) = self.state().watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }

        let resuming = !target_data.resume_token.is_empty()
            || target_data.snapshot_version > SnapshotVersion::min();
        let target_data = if resuming {
            let expected_count = self.syncer()?.get_remote_keys_for_target(target_id).len();
            target_data.with_expected_count(Some(expected_count as i32))
        } else {
            target_data
        };
        self.inner.watch_stream.watch(&target_data).await
    }

    async fn send_unwatch_request(&self, target_id: TargetId) -> FirestoreResult<()> {
        if let Some(aggregator) = self.state().watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.inner.watch_stream.unwatch(target_id).await
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network()
            && !self.inner.watch_stream.is_started()
            && !lock(&self.inner.listen_targets).is_empty()
    }

    fn clean_up_watch_stream_state(&self) {
        self.state().watch_change_aggregator = None;
    }

    async fn start_watch_stream(&self) {
        let metadata = Arc::new(ListenTargetMetadata {
            listen_targets: Arc::clone(&self.inner.listen_targets),
            syncer: Arc::clone(&self.inner.syncer),
            database_id: self.inner.database_id.clone(),
        });
        self.state().watch_change_aggregator = Some(WatchChangeAggregator::new(metadata));
        self.inner.watch_stream.start();
        self.inner.online_state_tracker.handle_watch_stream_start().await;
    }

    async fn on_watch_stream_open(&self) -> FirestoreResult<()> {
        let targets: Vec<TargetData> = lock(&self.inner.listen_targets).values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(target_data).await?;
        }
        Ok(())
    }

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        self.clean_up_watch_stream_state();

        if self.should_start_watch_stream() {
            self.inner
                .online_state_tracker
                .handle_watch_stream_failure(error.as_ref())
                .await;
            self.start_watch_stream().await;
        } else {
            // Stopped on purpose or idle: the connection is not to blame.
            self.inner.online_state_tracker.set(OnlineState::Unknown).await;
        }
        Ok(())
    }

    async fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: Option<SnapshotVersion>,
    ) -> FirestoreResult<()> {
        self.inner.online_state_tracker.set(OnlineState::Online).await;

        if let WatchChange::Target(target_change) = &change {
            if target_change.state == TargetChangeState::Remove {
                if let Some(cause) = target_change.cause.clone() {
                    if let Err(error) = self.handle_target_error(&target_change.target_ids, cause).await {
                        self.disable_network_until_recovery(error).await?;
                    }
                    return Ok(());
                }
            }
        }

        {
            let mut state = self.state();
            let mismatch = {
                let Some(aggregator) = state.watch_change_aggregator.as_mut() else {
                    return Ok(());
                };
                match change {
                    WatchChange::Document(change) => aggregator.handle_document_change(change),
                    WatchChange::ExistenceFilter(change) => aggregator.handle_existence_filter(&change),
                    WatchChange::Target(change) => aggregator.handle_target_change(&change),
                }
                aggregator.last_existence_filter_mismatch().cloned()
            };
            if mismatch.is_some() {
                state.last_existence_filter_mismatch = mismatch;
            }
        }

        let Some(snapshot_version) = snapshot_version else {
            return Ok(());
        };
        if snapshot_version == SnapshotVersion::min() {
            return Ok(());
        }
        let result: FirestoreResult<()> = async {
            let last_remote_version = self.inner.local_store.get_last_remote_snapshot_version()?;
            if snapshot_version >= last_remote_version {
                self.raise_watch_snapshot(snapshot_version).await?;
            }
            Ok(())
        }
        .await;
        if let Err(error) = result {
            log::debug!("remote store: failed to raise snapshot: {error}");
            self.disable_network_until_recovery(error).await?;
        }
        Ok(())
    }

    /// Turns the aggregated changes into a remote event, records new resume
    /// tokens, and re-listens to targets whose membership has to be rebuilt.
    async fn raise_watch_snapshot(&self, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        let event = {
            let mut state = self.state();
            match state.watch_change_aggregator.as_mut() {
                Some(aggregator) => aggregator.create_remote_event(snapshot_version),
                None => return Ok(()),
            }
        };

        let mut relistens = Vec::new();
        {
            let mut targets = lock(&self.inner.listen_targets);
            for (target_id, change) in &event.target_changes {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target_data) = targets.get(target_id).cloned() {
                    targets.insert(
                        *target_id,
                        target_data.with_resume_token(change.resume_token.clone(), snapshot_version),
                    );
                }
            }

            for (target_id, purpose) in &event.target_mismatches {
                let Some(target_data) = targets.get(target_id).cloned() else {
                    continue;
                };
                let version = target_data.snapshot_version;
                // The token would resume inside the mismatched state.
                targets.insert(*target_id, target_data.clone().with_resume_token(Vec::new(), version));
                relistens.push(TargetData::new(
                    target_data.target,
                    *target_id,
                    *purpose,
                    target_data.sequence_number,
                ));
            }
        }

        for request in relistens {
            self.send_unwatch_request(request.target_id).await?;
            self.send_watch_request(request).await?;
        }

        self.syncer()?.apply_remote_event(event).await
    }

    async fn handle_target_error(&self, target_ids: &[TargetId], cause: FirestoreError) -> FirestoreResult<()> {
        for target_id in target_ids {
            let removed = lock(&self.inner.listen_targets).remove(target_id).is_some();
            if !removed {
                continue;
            }
            if let Some(aggregator) = self.state().watch_change_aggregator.as_mut() {
                aggregator.remove_target(*target_id);
            }
            self.syncer()?.reject_listen(*target_id, cause.clone()).await?;
        }
        Ok(())
    }

    /// Takes the network down after a local persistence failure and retries
    /// a probe read on the async queue until persistence works again. Other
    /// errors are returned unchanged.
    async fn disable_network_until_recovery(&self, error: FirestoreError) -> FirestoreResult<()> {
        if !error.is_primary_lease_lost() {
            return Err(error);
        }
        log::debug!("remote store: disabling network until persistence recovers: {error}");
        self.state().offline_causes.insert(OfflineCause::PersistenceFailure);
        self.disable_network_internal().await;
        self.inner.online_state_tracker.set(OnlineState::Offline).await;

        let weak = Arc::downgrade(&self.inner);
        self.inner.queue.enqueue_retryable(move || {
            let weak = weak.clone();
            async move {
                let Some(store) = RemoteStore::from_weak(&weak) else {
                    return Ok(());
                };
                store.inner.local_store.get_last_remote_snapshot_version()?;
                log::debug!("remote store: persistence recovered");
                store.state().offline_causes.remove(&OfflineCause::PersistenceFailure);
                store.enable_network_internal().await
            }
        });
        Ok(())
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        let state = self.state();
        state.offline_causes.is_empty() && state.write_pipeline.len() < self.inner.max_pending_writes
    }

    /// Pulls queued batches from the local store until the pipeline is full
    /// and starts the write stream when there is something to send.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        let mut last_batch_id = self.state().write_pipeline.back().map(|batch| batch.batch_id);

        while self.can_add_to_write_pipeline() {
            let batch = match self.inner.local_store.next_mutation_batch(last_batch_id) {
                Ok(batch) => batch,
                Err(error) => return self.disable_network_until_recovery(error).await,
            };
            let Some(batch) = batch else {
                if self.state().write_pipeline.is_empty() {
                    self.inner.write_stream.mark_idle();
                }
                break;
            };
            last_batch_id = Some(batch.batch_id);
            self.add_to_write_pipeline(batch).await?;
        }

        if self.should_start_write_stream() {
            self.inner.write_stream.start();
        }
        Ok(())
    }

    async fn add_to_write_pipeline(&self, batch: MutationBatch) -> FirestoreResult<()> {
        let mutations = batch.mutations.clone();
        self.state().write_pipeline.push_back(batch);
        if self.inner.write_stream.is_open() && self.inner.write_stream.handshake_complete() {
            self.inner.write_stream.write_mutations(&mutations).await?;
        }
        Ok(())
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network()
            && !self.inner.write_stream.is_started()
            && !self.state().write_pipeline.is_empty()
    }

    async fn on_write_stream_open(&self) -> FirestoreResult<()> {
        self.inner.write_stream.write_handshake().await
    }

    async fn on_write_handshake_complete(&self) -> FirestoreResult<()> {
        let token = self.inner.write_stream.last_stream_token();
        if let Err(error) = self.inner.local_store.set_last_stream_token(token) {
            return self.disable_network_until_recovery(error).await;
        }

        let pending: Vec<_> = self
            .state()
            .write_pipeline
            .iter()
            .map(|batch| batch.mutations.clone())
            .collect();
        for mutations in pending {
            self.inner.write_stream.write_mutations(&mutations).await?;
        }
        Ok(())
    }

    async fn on_mutation_result(&self, response: WriteResponse) -> FirestoreResult<()> {
        let batch = self
            .state()
            .write_pipeline
            .pop_front()
            .ok_or_else(|| internal_error("Got a write result for an empty write pipeline"))?;
        let result = MutationBatchResult::from(
            batch,
            response.commit_version,
            response.mutation_results,
            response.stream_token,
        )?;
        if let Err(error) = self.syncer()?.apply_successful_write(result).await {
            self.disable_network_until_recovery(error).await?;
        }
        self.fill_write_pipeline().await
    }

    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        if let Some(error) = error {
            let has_pending = !self.state().write_pipeline.is_empty();
            if has_pending {
                if self.inner.write_stream.handshake_complete() {
                    self.handle_write_error(error).await?;
                } else {
                    self.handle_handshake_error(error).await?;
                }
            }
        }

        if self.should_start_write_stream() {
            self.inner.write_stream.start();
        }
        Ok(())
    }

    /// A permanent error fails the head batch; it is not retried. Transient
    /// errors leave the pipeline alone and the stream reconnects.
    async fn handle_write_error(&self, error: FirestoreError) -> FirestoreResult<()> {
        if !error.code.is_permanent_write_error() {
            return Ok(());
        }
        let batch = self.state().write_pipeline.pop_front();
        // The error was the backend's answer, not a connection problem.
        self.inner.write_stream.inhibit_backoff();
        if let Some(batch) = batch {
            log::debug!("remote store: rejecting batch {} after {error}", batch.batch_id);
            if let Err(error) = self.syncer()?.reject_failed_write(batch.batch_id, error).await {
                self.disable_network_until_recovery(error).await?;
            }
        }
        self.fill_write_pipeline().await
    }

    async fn handle_handshake_error(&self, error: FirestoreError) -> FirestoreResult<()> {
        if !error.code.is_permanent() {
            return Ok(());
        }
        log::debug!("remote store: write stream handshake failed, clearing stream token: {error}");
        self.inner.write_stream.set_last_stream_token(Vec::new());
        if let Err(error) = self.inner.local_store.set_last_stream_token(Vec::new()) {
            self.disable_network_until_recovery(error).await?;
        }
        Ok(())
    }

    /// Restarts both streams under the new user once the sync engine has
    /// switched its local state over.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        self.inner.queue.verify_operation_in_progress()?;
        log::debug!("remote store: received new credentials");
        let used_network = self.can_use_network();

        self.state().offline_causes.insert(OfflineCause::CredentialChange);
        self.disable_network_internal().await;
        if used_network {
            self.inner.online_state_tracker.set(OnlineState::Unknown).await;
        }

        let result = self.syncer()?.handle_credential_change(user).await;
        self.state().offline_causes.remove(&OfflineCause::CredentialChange);
        result?;
        self.enable_network_internal().await
    }

    /// Called when the device gains or loses connectivity. Streams restart
    /// right away so reconnecting skips any pending backoff.
    pub async fn apply_connectivity_change(&self, online: bool) -> FirestoreResult<()> {
        if !self.can_use_network() {
            return Ok(());
        }
        log::debug!("remote store: restarting streams after connectivity change (online: {online})");
        self.state().offline_causes.insert(OfflineCause::ConnectivityChange);
        self.disable_network_internal().await;
        self.inner.online_state_tracker.set(OnlineState::Unknown).await;
        self.state().offline_causes.remove(&OfflineCause::ConnectivityChange);
        self.enable_network_internal().await
    }

    /// Only the primary client talks to the backend.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        if is_primary {
            self.state().offline_causes.remove(&OfflineCause::IsSecondary);
            self.enable_network_internal().await
        } else {
            self.state().offline_causes.insert(OfflineCause::IsSecondary);
            self.disable_network_internal().await;
            self.inner.online_state_tracker.set(OnlineState::Unknown).await;
            Ok(())
        }
    }
}

struct ListenTargetMetadata {
    listen_targets: ListenTargets,
    syncer: SyncerSlot,
    database_id: DatabaseId,
}

impl TargetMetadataProvider for ListenTargetMetadata {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        upgrade_syncer(&self.syncer)
            .map(|syncer| syncer.get_remote_keys_for_target(target_id))
            .unwrap_or_default()
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        lock(&self.listen_targets).get(&target_id).cloned()
    }

    fn database_id(&self) -> DatabaseId {
        self.database_id.clone()
    }
}

struct RemoteListenDelegate {
    store: Weak<RemoteStoreInner>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl ListenStreamDelegate for RemoteListenDelegate {
    async fn on_listen_open(&self) -> FirestoreResult<()> {
        match RemoteStore::from_weak(&self.store) {
            Some(store) => store.on_watch_stream_open().await,
            None => Ok(()),
        }
    }

    async fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: Option<SnapshotVersion>,
    ) -> FirestoreResult<()> {
        match RemoteStore::from_weak(&self.store) {
            Some(store) => store.on_watch_change(change, snapshot_version).await,
            None => Ok(()),
        }
    }

    async fn on_listen_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        match RemoteStore::from_weak(&self.store) {
            Some(store) => store.on_watch_stream_close(error).await,
            None => Ok(()),
        }
    }
}

struct RemoteWriteDelegate {
    store: Weak<RemoteStoreInner>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl WriteStreamDelegate for RemoteWriteDelegate {
    async fn on_write_open(&self) -> FirestoreResult<()> {
        match RemoteStore::from_weak(&self.store) {
            Some(store) => store.on_write_stream_open().await,
            None => Ok(()),
        }
    }

    async fn on_handshake_complete(&self) -> FirestoreResult<()> {
        match RemoteStore::from_weak(&self.store) {
            Some(store) => store.on_write_handshake_complete().await,
            None => Ok(()),
        }
    }

    async fn on_write_response(&self, response: WriteResponse) -> FirestoreResult<()> {
        match RemoteStore::from_weak(&self.store) {
            Some(store) => store.on_mutation_result(response).await,
            None => Ok(()),
        }
    }

    async fn on_write_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        match RemoteStore::from_weak(&self.store) {
            Some(store) => store.on_write_stream_close(error).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value as JsonValue};

    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::error::{not_found, permission_denied, FirestoreErrorCode};
    use crate::firestore::local::memory::MemoryPersistence;
    use crate::firestore::local::{QueryEngineSettings, TargetPurpose};
    use crate::firestore::model::{BatchId, Mutation, ResourcePath};
    use crate::firestore::remote::credentials::EmptyCredentialsProvider;
    use crate::firestore::remote::remote_event::RemoteEvent;
    use crate::firestore::remote::stream::{InMemoryTransport, MultiplexedConnection, MultiplexedStream, StreamKind};
    use crate::firestore::settings::FirestoreSettings;
    use crate::firestore::value::ObjectValue;

    #[derive(Default)]
    struct Recorded {
        remote_events: Vec<RemoteEvent>,
        rejected_listens: Vec<(TargetId, FirestoreErrorCode)>,
        acknowledged: Vec<BatchId>,
        rejected_writes: Vec<(BatchId, FirestoreErrorCode)>,
        online_states: Vec<OnlineState>,
    }

    /// Applies writes to the local store like the sync engine would and
    /// records everything else.
    struct RecordingSyncer {
        local_store: Arc<LocalStore>,
        recorded: Mutex<Recorded>,
    }

    #[async_trait]
    impl RemoteSyncer for RecordingSyncer {
        async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()> {
            self.recorded.lock().unwrap().remote_events.push(event);
            Ok(())
        }

        async fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
            self.recorded.lock().unwrap().rejected_listens.push((target_id, error.code));
            Ok(())
        }

        async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()> {
            let batch_id = result.batch.batch_id;
            self.local_store.acknowledge_batch(&result)?;
            self.recorded.lock().unwrap().acknowledged.push(batch_id);
            Ok(())
        }

        async fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
            self.local_store.reject_batch(batch_id)?;
            self.recorded.lock().unwrap().rejected_writes.push((batch_id, error.code));
            Ok(())
        }

        fn get_remote_keys_for_target(&self, _target_id: TargetId) -> BTreeSet<DocumentKey> {
            BTreeSet::new()
        }

        async fn handle_credential_change(&self, _user: User) -> FirestoreResult<()> {
            Ok(())
        }

        async fn apply_online_state_change(&self, online_state: OnlineState) -> FirestoreResult<()> {
            self.recorded.lock().unwrap().online_states.push(online_state);
            Ok(())
        }
    }

    struct Harness {
        queue: AsyncQueue,
        local_store: Arc<LocalStore>,
        remote_store: RemoteStore,
        syncer: Arc<RecordingSyncer>,
        server: MultiplexedConnection,
        serializer: JsonProtoSerializer,
    }

    fn harness() -> Harness {
        let (client_transport, server_transport) = InMemoryTransport::pair();
        let queue = AsyncQueue::new();
        let database_id = DatabaseId::default_for("p");
        let local_store = Arc::new(LocalStore::new(
            Arc::new(MemoryPersistence::new()),
            QueryEngineSettings::default(),
            None,
        ));
        local_store.start().unwrap();
        let context = StreamContext {
            queue: queue.clone(),
            connection: Arc::new(MultiplexedConnection::new(client_transport)),
            database_id: database_id.clone(),
            auth: Arc::new(EmptyCredentialsProvider::new()),
            app_check: Arc::new(EmptyCredentialsProvider::new()),
            settings: FirestoreSettings::default(),
        };
        let remote_store = RemoteStore::new(Arc::clone(&local_store), context);
        let syncer = Arc::new(RecordingSyncer {
            local_store: Arc::clone(&local_store),
            recorded: Mutex::new(Recorded::default()),
        });
        let weak: Weak<dyn RemoteSyncer> = Arc::downgrade(&syncer) as Weak<dyn RemoteSyncer>;
        remote_store.set_syncer(weak);
        Harness {
            queue,
            local_store,
            remote_store,
            syncer,
            server: MultiplexedConnection::new(server_transport),
            serializer: JsonProtoSerializer::new(database_id),
        }
    }

    impl Harness {
        async fn run<F, Fut>(&self, f: F) -> FirestoreResult<()>
        where
            F: FnOnce(RemoteStore) -> Fut + Send + 'static,
            Fut: std::future::Future<Output = FirestoreResult<()>> + Send + 'static,
        {
            let store = self.remote_store.clone();
            self.queue.enqueue(move || f(store)).await
        }

        async fn settle(&self) {
            for _ in 0..8 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                self.queue.drain().await.unwrap();
            }
        }

        async fn accept(&self, kind: StreamKind) -> MultiplexedStream {
            let incoming = tokio::time::timeout(Duration::from_secs(2), self.server.accept())
                .await
                .expect("stream opened")
                .unwrap();
            assert_eq!(incoming.kind, kind);
            incoming.stream
        }

        fn target_data(&self, target_id: TargetId) -> TargetData {
            let query = Query::collection(ResourcePath::from_string("rooms").unwrap());
            TargetData::new(query.to_target(), target_id, TargetPurpose::Listen, 1)
        }

        fn recorded<T>(&self, f: impl FnOnce(&Recorded) -> T) -> T {
            f(&self.syncer.recorded.lock().unwrap())
        }
    }

    async fn read_json(stream: &MultiplexedStream) -> JsonValue {
        let payload = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("message arrived")
            .expect("stream open")
            .unwrap();
        serde_json::from_slice(&payload).unwrap()
    }

    async fn send_json(stream: &MultiplexedStream, message: JsonValue) {
        stream.send(serde_json::to_vec(&message).unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn listen_sends_target_and_raises_snapshot() {
        let h = harness();
        let target = h.target_data(2);
        h.run(|store| async move { store.start().await }).await.unwrap();
        h.run(move |store| async move { store.listen(target).await }).await.unwrap();

        let watch = h.accept(StreamKind::Listen).await;
        let request = read_json(&watch).await;
        assert_eq!(request["addTarget"]["targetId"], json!(2));

        let read_time = h.serializer.encode_version(SnapshotVersion::from_micros(1_000_000));
        send_json(&watch, json!({"targetChange": {"targetChangeType": "ADD", "targetIds": [2]}})).await;
        send_json(
            &watch,
            json!({"documentChange": {
                "document": {
                    "name": h.serializer.document_name(&DocumentKey::from_string("rooms/a").unwrap()),
                    "fields": {},
                    "updateTime": read_time,
                },
                "targetIds": [2],
            }}),
        )
        .await;
        send_json(
            &watch,
            json!({"targetChange": {"targetChangeType": "CURRENT", "targetIds": [2], "resumeToken": "dG9rZW4="}}),
        )
        .await;
        send_json(&watch, json!({"targetChange": {"readTime": read_time}})).await;
        h.settle().await;

        assert_eq!(h.remote_store.online_state(), OnlineState::Online);
        let event = h.recorded(|r| r.remote_events.last().cloned()).expect("remote event");
        assert_eq!(event.snapshot_version, SnapshotVersion::from_micros(1_000_000));
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.added_documents.len(), 1);
        assert!(h.recorded(|r| r.online_states.contains(&OnlineState::Online)));
    }

    #[tokio::test]
    async fn rejected_target_is_forgotten() {
        let h = harness();
        let target = h.target_data(4);
        h.run(|store| async move { store.start().await }).await.unwrap();
        h.run(move |store| async move { store.listen(target).await }).await.unwrap();

        let watch = h.accept(StreamKind::Listen).await;
        read_json(&watch).await;
        send_json(
            &watch,
            json!({"targetChange": {
                "targetChangeType": "REMOVE",
                "targetIds": [4],
                "cause": {"code": 7, "message": "denied"},
            }}),
        )
        .await;
        h.settle().await;

        assert_eq!(
            h.recorded(|r| r.rejected_listens.clone()),
            vec![(4, FirestoreErrorCode::PermissionDenied)]
        );
        assert!(h.remote_store.listen_target_ids().is_empty());
    }

    #[tokio::test]
    async fn cause_on_current_change_does_not_reject_the_listen() {
        let h = harness();
        let target = h.target_data(2);
        h.run(|store| async move { store.start().await }).await.unwrap();
        h.run(move |store| async move { store.listen(target).await }).await.unwrap();

        let watch = h.accept(StreamKind::Listen).await;
        read_json(&watch).await;
        let read_time = h.serializer.encode_version(SnapshotVersion::from_micros(2_000_000));
        send_json(&watch, json!({"targetChange": {"targetChangeType": "ADD", "targetIds": [2]}})).await;
        send_json(
            &watch,
            json!({"targetChange": {
                "targetChangeType": "CURRENT",
                "targetIds": [2],
                "resumeToken": "dG9rZW4=",
                "cause": {"code": 7, "message": "denied"},
            }}),
        )
        .await;
        send_json(&watch, json!({"targetChange": {"readTime": read_time}})).await;
        h.settle().await;

        assert!(h.recorded(|r| r.rejected_listens.is_empty()));
        assert_eq!(h.remote_store.listen_target_ids(), vec![2]);
        let event = h.recorded(|r| r.remote_events.last().cloned()).expect("remote event");
        assert!(event.target_changes[&2].current);
    }

    fn write_locally(h: &Harness, path: &str) -> BatchId {
        let key = DocumentKey::from_string(path).unwrap();
        h.local_store
            .write_locally(vec![Mutation::set(key, ObjectValue::empty())])
            .unwrap()
            .batch_id
    }

    #[tokio::test]
    async fn writes_flow_through_handshake_and_acknowledgement() {
        let h = harness();
        let batch_id = write_locally(&h, "rooms/a");
        h.run(|store| async move { store.start().await }).await.unwrap();

        let write = h.accept(StreamKind::Write).await;
        let handshake = read_json(&write).await;
        assert_eq!(handshake["database"], json!("projects/p/databases/(default)"));
        send_json(&write, json!({"streamToken": "AQ=="})).await;

        let request = read_json(&write).await;
        assert_eq!(request["streamToken"], json!("AQ=="));
        assert_eq!(request["writes"].as_array().map(Vec::len), Some(1));

        let commit_time = h.serializer.encode_version(SnapshotVersion::from_micros(5_000_000));
        send_json(
            &write,
            json!({"streamToken": "Ag==", "commitTime": commit_time, "writeResults": [{"updateTime": commit_time}]}),
        )
        .await;
        h.settle().await;

        assert_eq!(h.recorded(|r| r.acknowledged.clone()), vec![batch_id]);
        assert_eq!(h.remote_store.write_pipeline_len(), 0);
        assert_eq!(h.local_store.get_last_stream_token().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn permanent_write_error_rejects_the_head_batch() {
        let h = harness();
        let first = write_locally(&h, "rooms/a");
        let second = write_locally(&h, "rooms/b");
        h.run(|store| async move { store.start().await }).await.unwrap();

        let write = h.accept(StreamKind::Write).await;
        read_json(&write).await;
        send_json(&write, json!({"streamToken": "AQ=="})).await;
        read_json(&write).await;
        read_json(&write).await;
        write.fail(permission_denied("no writes for you")).await.unwrap();
        h.settle().await;

        assert_eq!(
            h.recorded(|r| r.rejected_writes.clone()),
            vec![(first, FirestoreErrorCode::PermissionDenied)]
        );

        // The stream reconnects without backoff and resends the rest.
        let write = h.accept(StreamKind::Write).await;
        read_json(&write).await;
        send_json(&write, json!({"streamToken": "Aw=="})).await;
        let resent = read_json(&write).await;
        assert_eq!(resent["writes"].as_array().map(Vec::len), Some(1));
        assert_eq!(
            resent["writes"][0]["update"]["name"],
            json!(h.serializer.document_name(&DocumentKey::from_string("rooms/b").unwrap()))
        );
        assert_eq!(h.remote_store.write_pipeline_len(), 1);
        let pending = h.local_store.next_mutation_batch(None).unwrap().expect("pending batch");
        assert_eq!(pending.batch_id, second);
        assert_eq!(h.local_store.get_highest_unacknowledged_batch_id().unwrap(), second);
    }

    #[tokio::test]
    async fn handshake_failure_clears_stream_token() {
        let h = harness();
        h.local_store.set_last_stream_token(vec![9]).unwrap();
        write_locally(&h, "rooms/a");
        h.run(|store| async move { store.start().await }).await.unwrap();

        let write = h.accept(StreamKind::Write).await;
        read_json(&write).await;
        write.fail(not_found("stale token")).await.unwrap();
        h.settle().await;

        assert!(h.local_store.get_last_stream_token().unwrap().is_empty());
        assert!(h.recorded(|r| r.rejected_writes.is_empty()));
    }

    #[tokio::test]
    async fn disable_network_goes_offline_and_keeps_targets() {
        let h = harness();
        let target = h.target_data(2);
        h.run(|store| async move { store.start().await }).await.unwrap();
        h.run(move |store| async move { store.listen(target).await }).await.unwrap();
        let _watch = h.accept(StreamKind::Listen).await;
        h.settle().await;

        h.run(|store| async move { store.disable_network().await }).await.unwrap();
        assert_eq!(h.remote_store.online_state(), OnlineState::Offline);
        assert!(!h.remote_store.can_use_network());
        assert_eq!(h.remote_store.listen_target_ids(), vec![2]);

        h.run(|store| async move { store.enable_network().await }).await.unwrap();
        let watch = h.accept(StreamKind::Listen).await;
        let request = read_json(&watch).await;
        assert_eq!(request["addTarget"]["targetId"], json!(2));
    }
}
