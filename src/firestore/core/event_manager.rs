use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::firestore::core::sync_engine::{SyncEngine, SyncEngineListener};
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::core::Query;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::remote::OnlineState;

/// Receives the snapshots of one query listener, or the error that ended it.
pub type QueryCallback = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>;
pub type SnapshotsInSyncCallback = Arc<dyn Fn() + Send + Sync>;

/// Where a listener takes its data from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ListenSource {
    /// The cache, kept up to date by the backend.
    #[default]
    Default,
    /// Only the cache; the target is never sent to the backend.
    Cache,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots whose only change is `from_cache` or pending writes.
    pub include_metadata_changes: bool,
    /// Hold back the first snapshot from cache while the client may be
    /// online, waiting for the backend instead.
    pub wait_for_sync_when_online: bool,
    pub source: ListenSource,
}

impl ListenOptions {
    pub fn with_include_metadata_changes(mut self, value: bool) -> Self {
        self.include_metadata_changes = value;
        self
    }

    pub fn with_wait_for_sync_when_online(mut self, value: bool) -> Self {
        self.wait_for_sync_when_online = value;
        self
    }

    pub fn with_source(mut self, source: ListenSource) -> Self {
        self.source = source;
        self
    }
}

/// One user listener and the raise rules applied to its snapshots.
struct QueryListener {
    id: u64,
    options: ListenOptions,
    callback: QueryCallback,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

/// Callback invocations collected under the lock and run after it.
type PendingEvents = Vec<(QueryCallback, FirestoreResult<ViewSnapshot>)>;

impl QueryListener {
    fn new(id: u64, options: ListenOptions, callback: QueryCallback) -> Self {
        Self {
            id,
            options,
            callback,
            raised_initial_event: false,
            snapshot: None,
            online_state: OnlineState::Unknown,
        }
    }

    fn listens_to_remote_store(&self) -> bool {
        self.options.source != ListenSource::Cache
    }

    fn on_view_snapshot(&mut self, snapshot: &ViewSnapshot, events: &mut PendingEvents) -> bool {
        let mut snapshot = snapshot.clone();
        if !self.options.include_metadata_changes {
            snapshot
                .doc_changes
                .retain(|change| change.change_type != ChangeType::Metadata);
            snapshot.excludes_metadata_changes = true;
        }

        let mut raised = false;
        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot, events);
                raised = true;
            }
        } else if self.should_raise_event(&snapshot) {
            events.push((Arc::clone(&self.callback), Ok(snapshot.clone())));
            raised = true;
        }
        self.snapshot = Some(snapshot);
        raised
    }

    fn apply_online_state_change(&mut self, online_state: OnlineState, events: &mut PendingEvents) -> bool {
        self.online_state = online_state;
        let Some(snapshot) = self.snapshot.clone() else {
            return false;
        };
        if !self.raised_initial_event && self.should_raise_initial_event(&snapshot, online_state) {
            self.raise_initial_event(&snapshot, events);
            return true;
        }
        false
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache || !self.listens_to_remote_store() {
            return true;
        }
        // Unknown counts as online: it settles on Online or Offline soon.
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        !snapshot.docs.is_empty() || snapshot.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot, events: &mut PendingEvents) {
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.docs.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.has_cached_results,
        );
        self.raised_initial_event = true;
        events.push((Arc::clone(&self.callback), Ok(initial)));
    }
}

#[derive(Default)]
struct QueryListenersInfo {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<QueryListener>,
}

impl QueryListenersInfo {
    fn has_remote_listeners(&self) -> bool {
        self.listeners.iter().any(QueryListener::listens_to_remote_store)
    }
}

enum ListenAction {
    InitializeLocalListenAndRequireWatchConnection,
    InitializeLocalListenOnly,
    RequireWatchConnectionOnly,
    None,
}

enum UnlistenAction {
    TerminateLocalListenAndRequireWatchDisconnection,
    TerminateLocalListenOnly,
    RequireWatchDisconnectionOnly,
    None,
}

struct EventManagerState {
    /// Listeners by query canonical id.
    queries: BTreeMap<String, QueryListenersInfo>,
    online_state: OnlineState,
    snapshots_in_sync_listeners: BTreeMap<u64, SnapshotsInSyncCallback>,
    next_listener_id: u64,
}

/// Fans the sync engine's snapshots out to the user's query listeners.
/// Listeners of equal queries share one view and one target.
pub struct EventManager {
    sync_engine: Arc<SyncEngine>,
    state: Mutex<EventManagerState>,
}

impl EventManager {
    pub fn new(sync_engine: Arc<SyncEngine>) -> Arc<Self> {
        let manager = Arc::new(Self {
            sync_engine,
            state: Mutex::new(EventManagerState {
                queries: BTreeMap::new(),
                online_state: OnlineState::Unknown,
                snapshots_in_sync_listeners: BTreeMap::new(),
                next_listener_id: 1,
            }),
        });
        let listener = Arc::downgrade(&manager) as std::sync::Weak<dyn SyncEngineListener>;
        manager.sync_engine.set_listener(listener);
        manager
    }

    fn state(&self) -> MutexGuard<'_, EventManagerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn online_state(&self) -> OnlineState {
        self.state().online_state
    }

    /// Registers a listener for `query` and returns its id. A failure to set
    /// up the query is delivered to `callback`.
    pub async fn listen(&self, query: Query, options: ListenOptions, callback: QueryCallback) -> u64 {
        let canonical_id = query.canonical_id();
        let listens_to_remote = options.source != ListenSource::Cache;
        let action = {
            let state = self.state();
            match state.queries.get(&canonical_id) {
                None if listens_to_remote => ListenAction::InitializeLocalListenAndRequireWatchConnection,
                None => ListenAction::InitializeLocalListenOnly,
                Some(info) if !info.has_remote_listeners() && listens_to_remote => {
                    ListenAction::RequireWatchConnectionOnly
                }
                Some(_) => ListenAction::None,
            }
        };

        let result = match action {
            ListenAction::InitializeLocalListenAndRequireWatchConnection => {
                self.sync_engine.listen(&query, true).await.map(Some)
            }
            ListenAction::InitializeLocalListenOnly => self.sync_engine.listen(&query, false).await.map(Some),
            ListenAction::RequireWatchConnectionOnly => {
                self.sync_engine.listen_to_remote_store(&query).await.map(|_| None)
            }
            ListenAction::None => Ok(None),
        };

        let mut events = PendingEvents::new();
        let (id, raised) = {
            let mut state = self.state();
            let id = state.next_listener_id;
            state.next_listener_id += 1;
            match result {
                Err(error) => {
                    log::warn!("event manager: initialization of query {canonical_id} failed: {error}");
                    events.push((Arc::clone(&callback), Err(error)));
                    (id, false)
                }
                Ok(initial) => {
                    let online_state = state.online_state;
                    let info = state.queries.entry(canonical_id).or_default();
                    if let Some(snapshot) = initial {
                        info.view_snapshot = Some(snapshot);
                    }
                    let mut listener = QueryListener::new(id, options, callback);
                    listener.apply_online_state_change(online_state, &mut events);
                    let raised = match info.view_snapshot.clone() {
                        Some(snapshot) => listener.on_view_snapshot(&snapshot, &mut events),
                        None => false,
                    };
                    info.listeners.push(listener);
                    (id, raised)
                }
            }
        };
        self.dispatch(events, raised);
        id
    }

    /// Removes the listener; the last listener of a query releases its
    /// view.
    pub async fn unlisten(&self, query: &Query, listener_id: u64) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let action = {
            let mut state = self.state();
            let Some(info) = state.queries.get_mut(&canonical_id) else {
                return Ok(());
            };
            let Some(position) = info.listeners.iter().position(|listener| listener.id == listener_id) else {
                return Ok(());
            };
            let removed = info.listeners.remove(position);
            if info.listeners.is_empty() {
                state.queries.remove(&canonical_id);
                if removed.listens_to_remote_store() {
                    UnlistenAction::TerminateLocalListenAndRequireWatchDisconnection
                } else {
                    UnlistenAction::TerminateLocalListenOnly
                }
            } else if !info.has_remote_listeners() && removed.listens_to_remote_store() {
                UnlistenAction::RequireWatchDisconnectionOnly
            } else {
                UnlistenAction::None
            }
        };

        match action {
            UnlistenAction::TerminateLocalListenAndRequireWatchDisconnection => {
                self.sync_engine.unlisten(query, true).await
            }
            UnlistenAction::TerminateLocalListenOnly => self.sync_engine.unlisten(query, false).await,
            UnlistenAction::RequireWatchDisconnectionOnly => {
                self.sync_engine.unlisten_from_remote_store(query).await
            }
            UnlistenAction::None => Ok(()),
        }
    }

    /// Calls `callback` now and every time all listeners have seen a
    /// consistent set of snapshots.
    pub fn add_snapshots_in_sync_listener(&self, callback: SnapshotsInSyncCallback) -> u64 {
        let id = {
            let mut state = self.state();
            let id = state.next_listener_id;
            state.next_listener_id += 1;
            state.snapshots_in_sync_listeners.insert(id, Arc::clone(&callback));
            id
        };
        callback();
        id
    }

    pub fn remove_snapshots_in_sync_listener(&self, id: u64) {
        self.state().snapshots_in_sync_listeners.remove(&id);
    }

    fn dispatch(&self, events: PendingEvents, raised: bool) {
        for (callback, event) in events {
            callback(event);
        }
        if raised {
            let listeners: Vec<SnapshotsInSyncCallback> =
                self.state().snapshots_in_sync_listeners.values().cloned().collect();
            for listener in listeners {
                listener();
            }
        }
    }
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        let mut events = PendingEvents::new();
        let mut raised = false;
        {
            let mut state = self.state();
            for snapshot in snapshots {
                let Some(info) = state.queries.get_mut(&snapshot.query.canonical_id()) else {
                    continue;
                };
                for listener in &mut info.listeners {
                    raised |= listener.on_view_snapshot(&snapshot, &mut events);
                }
                info.view_snapshot = Some(snapshot);
            }
        }
        self.dispatch(events, raised);
    }

    fn on_watch_error(&self, query: &Query, error: &FirestoreError) {
        let info = self.state().queries.remove(&query.canonical_id());
        let events: PendingEvents = info
            .into_iter()
            .flat_map(|info| info.listeners)
            .map(|listener| (listener.callback, Err(error.clone())))
            .collect();
        self.dispatch(events, false);
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let mut events = PendingEvents::new();
        let mut raised = false;
        {
            let mut state = self.state();
            state.online_state = online_state;
            for info in state.queries.values_mut() {
                for listener in &mut info.listeners {
                    raised |= listener.apply_online_state_change(online_state, &mut events);
                }
            }
        }
        self.dispatch(events, raised);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::firestore::core::view_snapshot::DocumentViewChange;
    use crate::firestore::model::{DocumentKey, DocumentSet, MutableDocument, ResourcePath, SnapshotVersion};
    use crate::firestore::value::ObjectValue;

    fn query() -> Query {
        Query::collection(ResourcePath::from_string("rooms").unwrap())
    }

    fn doc(path: &str) -> MutableDocument {
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            ObjectValue::empty(),
        )
    }

    fn snapshot(docs: &[MutableDocument], from_cache: bool, sync_state_changed: bool) -> ViewSnapshot {
        let mut set = DocumentSet::by_key_order();
        for doc in docs {
            set.add(doc.clone());
        }
        ViewSnapshot {
            query: query(),
            docs: set,
            old_docs: DocumentSet::by_key_order(),
            doc_changes: docs
                .iter()
                .map(|doc| DocumentViewChange {
                    change_type: ChangeType::Added,
                    doc: doc.clone(),
                })
                .collect(),
            mutated_keys: BTreeSet::new(),
            from_cache,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: false,
        }
    }

    fn listener(options: ListenOptions) -> QueryListener {
        QueryListener::new(1, options, Arc::new(|_| {}))
    }

    fn raised(events: &PendingEvents) -> Vec<ViewSnapshot> {
        events
            .iter()
            .filter_map(|(_, event)| event.as_ref().ok().cloned())
            .collect()
    }

    #[test]
    fn empty_cache_snapshot_waits_until_offline() {
        let mut listener = listener(ListenOptions::default());
        let mut events = PendingEvents::new();

        assert!(!listener.on_view_snapshot(&snapshot(&[], true, true), &mut events));
        assert!(events.is_empty());

        assert!(listener.apply_online_state_change(OnlineState::Offline, &mut events));
        let raised = raised(&events);
        assert_eq!(raised.len(), 1);
        assert!(raised[0].from_cache);
    }

    #[test]
    fn cached_documents_are_raised_unless_waiting_for_sync() {
        let mut events = PendingEvents::new();
        let mut eager = listener(ListenOptions::default());
        assert!(eager.on_view_snapshot(&snapshot(&[doc("rooms/a")], true, true), &mut events));

        let mut waiting = listener(ListenOptions::default().with_wait_for_sync_when_online(true));
        assert!(!waiting.on_view_snapshot(&snapshot(&[doc("rooms/a")], true, true), &mut events));
        assert!(waiting.on_view_snapshot(&snapshot(&[doc("rooms/a")], false, true), &mut events));
    }

    #[test]
    fn metadata_only_changes_need_opt_in() {
        let mut events = PendingEvents::new();
        let mut plain = listener(ListenOptions::default());
        let mut metadata = listener(ListenOptions::default().with_include_metadata_changes(true));
        let first = snapshot(&[doc("rooms/a")], true, true);
        plain.on_view_snapshot(&first, &mut events);
        metadata.on_view_snapshot(&first, &mut events);

        let mut synced = snapshot(&[doc("rooms/a")], false, true);
        synced.doc_changes.clear();
        assert!(!plain.on_view_snapshot(&synced, &mut events));
        assert!(metadata.on_view_snapshot(&synced, &mut events));
    }

    #[test]
    fn cache_listeners_raise_immediately() {
        let mut events = PendingEvents::new();
        let mut cache_only = listener(ListenOptions::default().with_source(ListenSource::Cache));
        assert!(cache_only.on_view_snapshot(&snapshot(&[], true, true), &mut events));
        assert!(raised(&events)[0].from_cache);
    }
}
