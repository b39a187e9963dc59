//! Entry point that assembles the sync engine's components.
//!
//! [`FirestoreClient`] owns the async queue and runs every call on it, so
//! the local store, remote store, sync engine and event manager only ever
//! see one operation at a time.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::firestore::core::event_manager::{EventManager, ListenOptions, QueryCallback, SnapshotsInSyncCallback};
use crate::firestore::core::transaction::Transaction;
use crate::firestore::core::transaction_runner::TransactionRunner;
use crate::firestore::core::view::View;
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::core::{Query, SyncEngine, WriteCompletion};
use crate::firestore::error::{cancelled, failed_precondition, unavailable, FirestoreResult};
use crate::firestore::local::memory::MemoryPersistence;
use crate::firestore::local::{LocalStore, MemorySharedClientState, Persistence, SharedClientState};
use crate::firestore::model::{DatabaseId, DocumentKey, MutableDocument, Mutation};
use crate::firestore::remote::{
    Connection, CredentialsProvider, Datastore, EmptyCredentialsProvider, RemoteStore, StreamContext, User,
};
use crate::firestore::settings::FirestoreSettings;
use crate::firestore::util::{AsyncQueue, TimerId};

const INDEX_BACKFILL_INITIAL_DELAY: Duration = Duration::from_secs(15);
const INDEX_BACKFILL_INTERVAL: Duration = Duration::from_secs(60);
const INDEX_BACKFILL_MAX_DOCUMENTS: usize = 50;
const GARBAGE_COLLECTION_INITIAL_DELAY: Duration = Duration::from_secs(60);
const GARBAGE_COLLECTION_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Everything a client is built from. The in-memory defaults cover tests
/// and clients without durable storage.
pub struct ClientComponents {
    pub database_id: DatabaseId,
    pub settings: FirestoreSettings,
    pub connection: Arc<dyn Connection>,
    pub datastore: Arc<dyn Datastore>,
    pub persistence: Arc<dyn Persistence>,
    pub shared_client_state: Arc<dyn SharedClientState>,
    pub auth: Arc<dyn CredentialsProvider>,
    pub app_check: Arc<dyn CredentialsProvider>,
}

impl ClientComponents {
    pub fn new(database_id: DatabaseId, connection: Arc<dyn Connection>, datastore: Arc<dyn Datastore>) -> Self {
        Self {
            database_id,
            settings: FirestoreSettings::default(),
            connection,
            datastore,
            persistence: Arc::new(MemoryPersistence::new()),
            shared_client_state: Arc::new(MemorySharedClientState::new()),
            auth: Arc::new(EmptyCredentialsProvider::new()),
            app_check: Arc::new(EmptyCredentialsProvider::new()),
        }
    }

    pub fn with_settings(mut self, settings: FirestoreSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_shared_client_state(mut self, shared_client_state: Arc<dyn SharedClientState>) -> Self {
        self.shared_client_state = shared_client_state;
        self
    }

    pub fn with_auth(mut self, auth: Arc<dyn CredentialsProvider>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_app_check(mut self, app_check: Arc<dyn CredentialsProvider>) -> Self {
        self.app_check = app_check;
        self
    }
}

struct ClientInner {
    queue: AsyncQueue,
    settings: FirestoreSettings,
    datastore: Arc<dyn Datastore>,
    persistence: Arc<dyn Persistence>,
    local_store: Arc<LocalStore>,
    sync_engine: Arc<SyncEngine>,
    event_manager: Arc<EventManager>,
    terminated: AtomicBool,
}

/// Handle to a running client. Clones share the same client.
#[derive(Clone)]
pub struct FirestoreClient {
    inner: Arc<ClientInner>,
}

impl FirestoreClient {
    /// Builds the components, starts persistence and opens the network.
    pub async fn start(components: ClientComponents) -> FirestoreResult<Self> {
        let ClientComponents {
            database_id,
            settings,
            connection,
            datastore,
            persistence,
            shared_client_state,
            auth,
            app_check,
        } = components;
        settings.validate()?;

        let queue = AsyncQueue::new();
        let local_store = Arc::new(LocalStore::new(
            Arc::clone(&persistence),
            settings.query_engine(),
            None,
        ));
        let context = StreamContext {
            queue: queue.clone(),
            connection,
            database_id,
            auth: Arc::clone(&auth),
            app_check,
            settings: settings.clone(),
        };
        let remote_store = RemoteStore::new(Arc::clone(&local_store), context);
        let is_primary = shared_client_state.is_primary_client();
        let sync_engine = SyncEngine::new(
            Arc::clone(&local_store),
            remote_store,
            shared_client_state,
            settings.max_concurrent_limbo_resolutions(),
        );
        let event_manager = EventManager::new(Arc::clone(&sync_engine));

        let client = Self {
            inner: Arc::new(ClientInner {
                queue: queue.clone(),
                settings,
                datastore,
                persistence,
                local_store: Arc::clone(&local_store),
                sync_engine: Arc::clone(&sync_engine),
                event_manager,
                terminated: AtomicBool::new(false),
            }),
        };

        queue
            .enqueue(move || async move {
                local_store.start()?;
                sync_engine.apply_primary_state(is_primary).await?;
                sync_engine.remote_store().start().await
            })
            .await?;

        schedule_maintenance(
            queue.clone(),
            Arc::downgrade(&client.inner.local_store),
            MaintenanceTask::IndexBackfill,
            INDEX_BACKFILL_INITIAL_DELAY,
        );
        schedule_maintenance(
            queue.clone(),
            Arc::downgrade(&client.inner.local_store),
            MaintenanceTask::GarbageCollection,
            GARBAGE_COLLECTION_INITIAL_DELAY,
        );

        // The provider reports the current user right away. Components start
        // out as the unauthenticated user, so only real changes restart the
        // streams.
        let listener_queue = queue.clone();
        let weak_engine = Arc::downgrade(&client.inner.sync_engine);
        let last_user = Mutex::new(User::unauthenticated());
        auth.set_change_listener(Arc::new(move |user: User| {
            {
                let mut last = last_user.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if *last == user {
                    return;
                }
                *last = user.clone();
            }
            let engine = weak_engine.clone();
            listener_queue.enqueue_and_forget(move || async move {
                match engine.upgrade() {
                    Some(engine) => engine.remote_store().handle_credential_change(user).await,
                    None => Ok(()),
                }
            });
        }));

        log::debug!("firestore client: started");
        Ok(client)
    }

    fn verify_not_terminated(&self) -> FirestoreResult<()> {
        if self.inner.terminated.load(Ordering::SeqCst) {
            return Err(failed_precondition("The client has already been terminated."));
        }
        Ok(())
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> &FirestoreSettings {
        &self.inner.settings
    }

    pub fn async_queue(&self) -> &AsyncQueue {
        &self.inner.queue
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.inner.sync_engine
    }

    /// Starts delivering snapshots of `query` to `callback` until the
    /// returned registration is detached or dropped.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        callback: QueryCallback,
    ) -> FirestoreResult<ListenerRegistration> {
        self.verify_not_terminated()?;
        let event_manager = Arc::clone(&self.inner.event_manager);
        let registered = query.clone();
        let id = self
            .inner
            .queue
            .enqueue(move || async move { Ok(event_manager.listen(registered, options, callback).await) })
            .await?;
        Ok(ListenerRegistration::new(self.clone(), query, id))
    }

    fn unlisten(&self, query: Query, listener_id: u64) {
        let event_manager = Arc::clone(&self.inner.event_manager);
        self.inner
            .queue
            .enqueue_and_forget(move || async move { event_manager.unlisten(&query, listener_id).await });
    }

    /// Runs `query` against the local cache only.
    pub async fn get_documents_from_local_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        self.verify_not_terminated()?;
        let local_store = Arc::clone(&self.inner.local_store);
        self.inner
            .queue
            .enqueue(move || async move {
                let result = local_store.execute_query(&query, true)?;
                let mut view = View::new(query, result.remote_keys);
                let documents: BTreeMap<DocumentKey, MutableDocument> = result
                    .documents
                    .into_iter()
                    .map(|document| (document.key().clone(), document))
                    .collect();
                let changes = view.compute_doc_changes(&documents, None);
                view.apply_changes(changes, false, None, false)
                    .snapshot
                    .ok_or_else(|| unavailable("Failed to compute a snapshot from the local cache."))
            })
            .await
    }

    /// Reads one document from the local cache. `Ok(None)` means the cache
    /// knows the document does not exist.
    pub async fn get_document_from_local_cache(&self, key: DocumentKey) -> FirestoreResult<Option<MutableDocument>> {
        self.verify_not_terminated()?;
        let local_store = Arc::clone(&self.inner.local_store);
        self.inner
            .queue
            .enqueue(move || async move {
                let document = local_store.read_document(&key)?;
                if document.is_found_document() {
                    Ok(Some(document))
                } else if document.is_no_document() {
                    Ok(None)
                } else {
                    Err(unavailable(
                        "Failed to get document from cache. (However, this document may exist on the server. \
                         Run again without setting source to CACHE to attempt to retrieve the document from the \
                         server.)",
                    ))
                }
            })
            .await
    }

    /// Applies `mutations` locally and resolves once the backend accepted
    /// or rejected them.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let sync_engine = Arc::clone(&self.inner.sync_engine);
        let completion = self
            .inner
            .queue
            .enqueue(move || async move { sync_engine.write(mutations).await })
            .await?;
        await_completion(completion).await
    }

    /// Resolves once every write issued so far has been acknowledged.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let sync_engine = Arc::clone(&self.inner.sync_engine);
        let completion = self
            .inner
            .queue
            .enqueue(move || async move { sync_engine.register_pending_writes_callback() })
            .await?;
        await_completion(completion).await
    }

    /// Runs `update_fn` in a transaction against the backend. The function
    /// may be called more than once.
    pub async fn run_transaction<T, F, Fut>(&self, update_fn: F) -> FirestoreResult<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = FirestoreResult<T>>,
    {
        self.verify_not_terminated()?;
        TransactionRunner::new(
            self.inner.queue.clone(),
            Arc::clone(&self.inner.datastore),
            self.inner.settings.transaction_max_attempts(),
            self.inner.settings.backoff(),
        )?
        .run(update_fn)
        .await
    }

    /// Registers `callback`, which is called now and whenever every active
    /// listener has seen a consistent set of snapshots.
    pub async fn add_snapshots_in_sync_listener(&self, callback: SnapshotsInSyncCallback) -> FirestoreResult<u64> {
        self.verify_not_terminated()?;
        let event_manager = Arc::clone(&self.inner.event_manager);
        self.inner
            .queue
            .enqueue(move || async move { Ok(event_manager.add_snapshots_in_sync_listener(callback)) })
            .await
    }

    pub async fn remove_snapshots_in_sync_listener(&self, id: u64) -> FirestoreResult<()> {
        let event_manager = Arc::clone(&self.inner.event_manager);
        self.inner
            .queue
            .enqueue(move || async move {
                event_manager.remove_snapshots_in_sync_listener(id);
                Ok(())
            })
            .await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let sync_engine = Arc::clone(&self.inner.sync_engine);
        self.inner
            .queue
            .enqueue(move || async move { sync_engine.remote_store().enable_network().await })
            .await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let sync_engine = Arc::clone(&self.inner.sync_engine);
        self.inner
            .queue
            .enqueue(move || async move { sync_engine.remote_store().disable_network().await })
            .await
    }

    /// Shuts the network and persistence down. Calls made afterwards fail;
    /// calling it twice is a no-op.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!("firestore client: terminating");
        let sync_engine = Arc::clone(&self.inner.sync_engine);
        let persistence = Arc::clone(&self.inner.persistence);
        self.inner
            .queue
            .enqueue_and_initiate_shutdown(move || async move {
                sync_engine.remote_store().shutdown().await?;
                persistence.shutdown();
                Ok(())
            })
            .await
    }
}

#[derive(Clone, Copy, Debug)]
enum MaintenanceTask {
    IndexBackfill,
    GarbageCollection,
}

impl MaintenanceTask {
    fn timer_id(self) -> TimerId {
        match self {
            MaintenanceTask::IndexBackfill => TimerId::IndexBackfill,
            MaintenanceTask::GarbageCollection => TimerId::GarbageCollection,
        }
    }

    fn interval(self) -> Duration {
        match self {
            MaintenanceTask::IndexBackfill => INDEX_BACKFILL_INTERVAL,
            MaintenanceTask::GarbageCollection => GARBAGE_COLLECTION_INTERVAL,
        }
    }

    fn run(self, local_store: &LocalStore) -> FirestoreResult<usize> {
        match self {
            MaintenanceTask::IndexBackfill => local_store.backfill_indexes(INDEX_BACKFILL_MAX_DOCUMENTS),
            MaintenanceTask::GarbageCollection => local_store.collect_garbage(),
        }
    }
}

/// Runs `task` after `delay` and then every `task.interval()` for as long as
/// the local store is alive. A shut down queue drops the pending timer.
fn schedule_maintenance(queue: AsyncQueue, local_store: Weak<LocalStore>, task: MaintenanceTask, delay: Duration) {
    let next_queue = queue.clone();
    queue.enqueue_after_delay(task.timer_id(), delay, move || async move {
        let Some(store) = local_store.upgrade() else {
            return Ok(());
        };
        match task.run(&store) {
            Ok(count) => log::debug!("firestore client: {task:?} processed {count} document(s)"),
            Err(error) if error.is_primary_lease_lost() => {
                log::debug!("firestore client: skipping {task:?}, not the primary client")
            }
            Err(error) => log::warn!("firestore client: {task:?} failed: {error}"),
        }
        drop(store);
        schedule_maintenance(next_queue, local_store, task, task.interval());
        Ok(())
    });
}

async fn await_completion(completion: WriteCompletion) -> FirestoreResult<()> {
    completion
        .await
        .map_err(|_| cancelled("The client was terminated before the write completed."))?
}

/// RAII handle for a query listener; dropping it stops the listener.
pub struct ListenerRegistration {
    client: FirestoreClient,
    query: Query,
    id: Option<u64>,
}

impl ListenerRegistration {
    fn new(client: FirestoreClient, query: Query, id: u64) -> Self {
        Self {
            client,
            query,
            id: Some(id),
        }
    }

    pub fn detach(mut self) {
        if let Some(id) = self.id.take() {
            self.client.unlisten(self.query.clone(), id);
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.client.unlisten(self.query.clone(), id);
        }
    }
}
