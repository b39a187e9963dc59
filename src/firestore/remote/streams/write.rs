use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::firestore::error::{failed_precondition, FirestoreError, FirestoreResult};
use crate::firestore::model::Mutation;
use crate::firestore::remote::serializer::{JsonProtoSerializer, WriteResponse};
use crate::firestore::remote::stream::{
    PersistentStream, PersistentStreamDelegate, PersistentStreamState, StreamContext, StreamKind,
};

/// Events of the write stream.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait WriteStreamDelegate: Send + Sync + 'static {
    async fn on_write_open(&self) -> FirestoreResult<()>;

    /// The handshake response arrived; mutations may be written now.
    async fn on_handshake_complete(&self) -> FirestoreResult<()>;

    async fn on_write_response(&self, response: WriteResponse) -> FirestoreResult<()>;

    async fn on_write_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

#[derive(Default)]
struct WriteStreamState {
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

struct WriteStreamHandler {
    serializer: Arc<JsonProtoSerializer>,
    delegate: Arc<dyn WriteStreamDelegate>,
    state: Arc<Mutex<WriteStreamState>>,
}

fn lock(state: &Mutex<WriteStreamState>) -> MutexGuard<'_, WriteStreamState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl PersistentStreamDelegate for WriteStreamHandler {
    async fn on_open(&self) -> FirestoreResult<()> {
        lock(&self.state).handshake_complete = false;
        self.delegate.on_write_open().await
    }

    async fn on_message(&self, message: JsonValue) -> FirestoreResult<()> {
        let response = self.serializer.decode_write_response(&message)?;
        let was_handshake = {
            let mut state = lock(&self.state);
            state.last_stream_token = response.stream_token.clone();
            let was_handshake = !state.handshake_complete;
            state.handshake_complete = true;
            was_handshake
        };

        if was_handshake {
            if !response.mutation_results.is_empty() {
                log::warn!("write stream: handshake response carried mutation results");
            }
            self.delegate.on_handshake_complete().await
        } else {
            self.delegate.on_write_response(response).await
        }
    }

    /// The delegate still sees the handshake flag of the closed stream, so
    /// it can tell a failed handshake from a failed write.
    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        let result = self.delegate.on_write_close(error).await;
        lock(&self.state).handshake_complete = false;
        result
    }
}

/// Write stream: a handshake first, then batches of mutations each answered
/// by one response carrying a fresh stream token.
#[derive(Clone)]
pub struct WriteStream {
    stream: PersistentStream,
    serializer: Arc<JsonProtoSerializer>,
    state: Arc<Mutex<WriteStreamState>>,
}

impl WriteStream {
    pub fn new(
        context: StreamContext,
        serializer: Arc<JsonProtoSerializer>,
        delegate: Arc<dyn WriteStreamDelegate>,
    ) -> Self {
        let state = Arc::new(Mutex::new(WriteStreamState::default()));
        let handler = Arc::new(WriteStreamHandler {
            serializer: Arc::clone(&serializer),
            delegate,
            state: Arc::clone(&state),
        });
        Self {
            stream: PersistentStream::new(StreamKind::Write, context, handler),
            serializer,
            state,
        }
    }

    pub fn handshake_complete(&self) -> bool {
        lock(&self.state).handshake_complete
    }

    pub fn last_stream_token(&self) -> Vec<u8> {
        lock(&self.state).last_stream_token.clone()
    }

    /// Token sent with the next request; restored from the mutation queue
    /// before the stream starts.
    pub fn set_last_stream_token(&self, token: Vec<u8>) {
        lock(&self.state).last_stream_token = token;
    }

    pub async fn write_handshake(&self) -> FirestoreResult<()> {
        if self.handshake_complete() {
            return Err(failed_precondition("Handshake already completed"));
        }
        self.stream.send(&self.serializer.encode_handshake()).await
    }

    pub async fn write_mutations(&self, mutations: &[Mutation]) -> FirestoreResult<()> {
        let token = {
            let state = lock(&self.state);
            if !state.handshake_complete {
                return Err(failed_precondition("Handshake must complete before writing mutations"));
            }
            state.last_stream_token.clone()
        };
        let request = self.serializer.encode_write_request(&token, mutations);
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
