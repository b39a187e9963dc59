use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::{SnapshotVersion, TargetId};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{
    PersistentStream, PersistentStreamDelegate, PersistentStreamState, StreamContext, StreamKind,
};
use crate::firestore::remote::watch_change::{decode_watch_change, snapshot_version_of, WatchChange};

/// Events of the listen (watch) stream.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait ListenStreamDelegate: Send + Sync + 'static {
    async fn on_listen_open(&self) -> FirestoreResult<()>;

    /// `snapshot_version` is set when the change marks a consistent snapshot
    /// across all targets.
    async fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: Option<SnapshotVersion>,
    ) -> FirestoreResult<()>;

    async fn on_listen_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

struct ListenStreamHandler {
    serializer: Arc<JsonProtoSerializer>,
    delegate: Arc<dyn ListenStreamDelegate>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl PersistentStreamDelegate for ListenStreamHandler {
    async fn on_open(&self) -> FirestoreResult<()> {
        self.delegate.on_listen_open().await
    }

    async fn on_message(&self, message: JsonValue) -> FirestoreResult<()> {
        let Some(change) = decode_watch_change(&self.serializer, &message)? else {
            return Ok(());
        };
        let snapshot_version = snapshot_version_of(&change);
        self.delegate.on_watch_change(change, snapshot_version).await
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        self.delegate.on_listen_close(error).await
    }
}

/// Watch stream: `addTarget`/`removeTarget` requests out, watch changes in.
#[derive(Clone)]
pub struct ListenStream {
    stream: PersistentStream,
    serializer: Arc<JsonProtoSerializer>,
}

impl ListenStream {
    pub fn new(
        context: StreamContext,
        serializer: Arc<JsonProtoSerializer>,
        delegate: Arc<dyn ListenStreamDelegate>,
    ) -> Self {
        let handler = Arc::new(ListenStreamHandler {
            serializer: Arc::clone(&serializer),
            delegate,
        });
        Self {
            stream: PersistentStream::new(StreamKind::Listen, context, handler),
            serializer,
        }
    }

    /// Registers `target_data` with the backend, resuming from its token or
    /// snapshot version when present.
    pub async fn watch(&self, target_data: &TargetData) -> FirestoreResult<()> {
        let request = self.serializer.encode_listen_request(target_data);
        self.stream.send(&request).await
    }

    pub async fn unwatch(&self, target_id: TargetId) -> FirestoreResult<()> {
        let request = self.serializer.encode_unlisten_request(target_id);
        self.stream.send(&request).await
    }

    pub fn start(&self) {
        self.stream.start();
    }

    pub async fn stop(&self) {
        self.stream.stop().await;
    }

    pub fn mark_idle(&self) {
        self.stream.mark_idle();
    }

    pub fn inhibit_backoff(&self) {
        self.stream.inhibit_backoff();
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    pub fn state(&self) -> PersistentStreamState {
        self.stream.state()
    }
}
