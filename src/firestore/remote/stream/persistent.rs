use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::firestore::error::{
    failed_precondition, internal_error, FirestoreError, FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::model::DatabaseId;
use crate::firestore::remote::connection::{stream_headers, Connection, StreamHandle};
use crate::firestore::remote::credentials::{CredentialsProvider, Token};
use crate::firestore::remote::rpc_error::decode_rpc_error;
use crate::firestore::settings::FirestoreSettings;
use crate::firestore::util::{AsyncQueue, DelayedOperation, TimerId};
use crate::platform::runtime;
use crate::util::backoff::ExponentialBackoff;

use super::StreamKind;

/// Lifecycle of a [`PersistentStream`].
///
/// ```text
/// Initial -> Starting -> Open -> Healthy
///    ^          |         |        |
///    |          +---------+--------+--> Error -> Backoff -> Starting
///    +-- stop/idle close --------------------------------> Stopped | Initial
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistentStreamState {
    Initial,
    Starting,
    Open,
    Healthy,
    Error,
    Backoff,
    Stopped,
}

/// Timer ids a stream schedules its delayed operations under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamTimers {
    pub connection_backoff: TimerId,
    pub idle: TimerId,
    pub health_check: TimerId,
}

impl StreamTimers {
    pub fn for_kind(kind: StreamKind) -> Self {
        match kind {
            StreamKind::Listen => Self {
                connection_backoff: TimerId::ListenStreamConnectionBackoff,
                idle: TimerId::ListenStreamIdle,
                health_check: TimerId::HealthCheckTimeout,
            },
            StreamKind::Write => Self {
                connection_backoff: TimerId::WriteStreamConnectionBackoff,
                idle: TimerId::WriteStreamIdle,
                health_check: TimerId::HealthCheckTimeout,
            },
        }
    }
}

/// Receives the events of one stream. Every callback runs on the async queue.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait PersistentStreamDelegate: Send + Sync + 'static {
    async fn on_open(&self) -> FirestoreResult<()>;

    async fn on_message(&self, message: JsonValue) -> FirestoreResult<()>;

    /// `error` is `None` only when the stream was stopped on purpose.
    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

/// Shared collaborators of the listen and write streams.
#[derive(Clone)]
pub struct StreamContext {
    pub queue: AsyncQueue,
    pub connection: Arc<dyn Connection>,
    pub database_id: DatabaseId,
    pub auth: Arc<dyn CredentialsProvider>,
    pub app_check: Arc<dyn CredentialsProvider>,
    pub settings: FirestoreSettings,
}

struct StreamState {
    state: PersistentStreamState,
    close_count: u64,
    backoff: ExponentialBackoff,
    handle: Option<Arc<dyn StreamHandle>>,
    idle_timer: Option<DelayedOperation>,
    health_timer: Option<DelayedOperation>,
    backoff_timer: Option<DelayedOperation>,
}

struct StreamInner {
    kind: StreamKind,
    context: StreamContext,
    timers: StreamTimers,
    delegate: Arc<dyn PersistentStreamDelegate>,
    state: Mutex<StreamState>,
}

impl StreamInner {
    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A stream that reconnects with backoff, closes itself when idle, and drops
/// callbacks from connections it already gave up on.
///
/// All methods must be called from the async queue.
#[derive(Clone)]
pub struct PersistentStream {
    inner: Arc<StreamInner>,
}

impl PersistentStream {
    pub fn new(kind: StreamKind, context: StreamContext, delegate: Arc<dyn PersistentStreamDelegate>) -> Self {
        Self::with_backoff(
            kind,
            ExponentialBackoff::new(context.settings.backoff()),
            context,
            delegate,
        )
    }

    /// Stream whose reconnect delays come from `backoff`.
    pub fn with_backoff(
        kind: StreamKind,
        backoff: ExponentialBackoff,
        context: StreamContext,
        delegate: Arc<dyn PersistentStreamDelegate>,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                kind,
                timers: StreamTimers::for_kind(kind),
                context,
                delegate,
                state: Mutex::new(StreamState {
                    state: PersistentStreamState::Initial,
                    close_count: 0,
                    backoff,
                    handle: None,
                    idle_timer: None,
                    health_timer: None,
                    backoff_timer: None,
                }),
            }),
        }
    }

    fn from_weak(weak: &Weak<StreamInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn kind(&self) -> StreamKind {
        self.inner.kind
    }

    pub fn state(&self) -> PersistentStreamState {
        self.inner.lock().state
    }

    /// True from `start` until the stream closes or fails, including while
    /// waiting on backoff.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state(),
            PersistentStreamState::Starting
                | PersistentStreamState::Backoff
                | PersistentStreamState::Open
                | PersistentStreamState::Healthy
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.state(),
            PersistentStreamState::Open | PersistentStreamState::Healthy
        )
    }

    /// Base of the delay the next reconnect attempt waits, before jitter.
    pub fn backoff_base(&self) -> Duration {
        self.inner.lock().backoff.current_base()
    }

    fn close_count(&self) -> u64 {
        self.inner.lock().close_count
    }

    /// Starts connecting. After an error the attempt waits out the backoff
    /// delay first.
    pub fn start(&self) {
        let close_count = {
            let mut state = self.inner.lock();
            let current = state.state;
            match current {
                PersistentStreamState::Error => {
                    drop(state);
                    self.perform_backoff();
                    return;
                }
                PersistentStreamState::Initial | PersistentStreamState::Stopped => {}
                other => {
                    log::debug!("{} stream: start ignored in state {other:?}", self.label());
                    return;
                }
            }
            state.state = PersistentStreamState::Starting;
            state.close_count
        };

        let auth = Arc::clone(&self.inner.context.auth);
        let app_check = Arc::clone(&self.inner.context.app_check);
        let weak = Arc::downgrade(&self.inner);
        runtime::spawn_detached(async move {
            let (auth_token, app_check_token) =
                futures::future::join(auth.get_token(false), app_check.get_token(false)).await;
            let tokens = match (auth_token, app_check_token) {
                (Ok(auth_token), Ok(app_check_token)) => Ok((auth_token, app_check_token)),
                (Err(error), _) | (_, Err(error)) => Err(error),
            };
            enqueue_guarded(&weak, close_count, move |stream| async move {
                match tokens {
                    Ok((auth_token, app_check_token)) => stream.open(auth_token, app_check_token).await,
                    Err(error) => stream.handle_stream_close(Some(error)).await,
                }
            });
        });
    }

    async fn open(&self, auth_token: Option<Token>, app_check_token: Option<Token>) {
        let headers = stream_headers(
            &self.inner.context.database_id,
            auth_token.as_ref(),
            app_check_token.as_ref(),
        );
        let handle = match self
            .inner
            .context
            .connection
            .open_stream(self.inner.kind, headers)
            .await
        {
            Ok(handle) => handle,
            Err(error) => {
                log::debug!("{} stream: open failed: {error}", self.label());
                self.handle_stream_close(Some(error)).await;
                return;
            }
        };

        let close_count = {
            let mut state = self.inner.lock();
            state.handle = Some(Arc::clone(&handle));
            state.state = PersistentStreamState::Open;
            state.close_count
        };
        self.schedule_health_check();
        self.spawn_reader(handle, close_count);

        if let Err(error) = self.inner.delegate.on_open().await {
            log::warn!("{} stream: open handler failed: {error}", self.label());
            self.close(PersistentStreamState::Error, Some(error)).await;
        }
    }

    fn spawn_reader(&self, handle: Arc<dyn StreamHandle>, close_count: u64) {
        let weak = Arc::downgrade(&self.inner);
        runtime::spawn_detached(async move {
            loop {
                match handle.next().await {
                    Some(Ok(payload)) => {
                        enqueue_guarded(&weak, close_count, move |stream| async move {
                            stream.handle_message(payload).await
                        });
                    }
                    Some(Err(error)) => {
                        enqueue_guarded(&weak, close_count, move |stream| async move {
                            stream.handle_stream_close(Some(error)).await
                        });
                        break;
                    }
                    None => {
                        enqueue_guarded(&weak, close_count, |stream| async move {
                            stream.handle_stream_close(None).await
                        });
                        break;
                    }
                }
                if weak.strong_count() == 0 {
                    break;
                }
            }
        });
    }

    fn schedule_health_check(&self) {
        let weak = Arc::downgrade(&self.inner);
        let timer = self.inner.context.queue.enqueue_after_delay(
            self.inner.timers.health_check,
            self.inner.context.settings.health_check_timeout(),
            move || async move {
                if let Some(stream) = PersistentStream::from_weak(&weak) {
                    let mut state = stream.inner.lock();
                    state.health_timer = None;
                    if state.state == PersistentStreamState::Open {
                        state.state = PersistentStreamState::Healthy;
                    }
                }
                Ok(())
            },
        );
        self.inner.lock().health_timer = Some(timer);
    }

    async fn handle_message(&self, payload: Vec<u8>) {
        let message: JsonValue = match serde_json::from_slice(&payload) {
            Ok(message) => message,
            Err(err) => {
                let error = internal_error(format!("Failed to decode {} response: {err}", self.label()));
                self.close(PersistentStreamState::Error, Some(error)).await;
                return;
            }
        };
        if let Some(error) = decode_rpc_error(&message) {
            self.handle_stream_close(Some(error)).await;
            return;
        }

        {
            let mut state = self.inner.lock();
            if state.state == PersistentStreamState::Open {
                state.state = PersistentStreamState::Healthy;
                if let Some(timer) = state.health_timer.take() {
                    timer.cancel();
                }
            }
            state.backoff.reset();
        }
        if let Err(error) = self.inner.delegate.on_message(message).await {
            log::warn!("{} stream: message handler failed: {error}", self.label());
            self.close(PersistentStreamState::Error, Some(error)).await;
        }
    }

    async fn handle_stream_close(&self, error: Option<FirestoreError>) {
        if !self.is_started() {
            return;
        }
        log::debug!("{} stream: closed by transport: {error:?}", self.label());
        self.close(PersistentStreamState::Error, error).await;
    }

    /// Sends `message` on the open stream and cancels a pending idle close.
    pub async fn send(&self, message: &JsonValue) -> FirestoreResult<()> {
        let handle = {
            let mut state = self.inner.lock();
            if let Some(timer) = state.idle_timer.take() {
                timer.cancel();
            }
            state.handle.clone()
        };
        let handle = handle.ok_or_else(|| failed_precondition(format!("{} stream is not open", self.label())))?;
        let payload = serde_json::to_vec(message)
            .map_err(|err| internal_error(format!("Failed to encode {} request: {err}", self.label())))?;
        handle.send(payload).await
    }

    /// Schedules an idle close unless one is pending already.
    pub fn mark_idle(&self) {
        if !self.is_open() || self.inner.lock().idle_timer.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let timer = self.inner.context.queue.enqueue_after_delay(
            self.inner.timers.idle,
            self.inner.context.settings.idle_timeout(),
            move || async move {
                if let Some(stream) = PersistentStream::from_weak(&weak) {
                    stream.inner.lock().idle_timer = None;
                    if stream.is_open() {
                        log::debug!("{} stream: closing idle stream", stream.label());
                        stream.close(PersistentStreamState::Initial, None).await;
                    }
                }
                Ok(())
            },
        );
        self.inner.lock().idle_timer = Some(timer);
    }

    /// Closes the stream for good; a later `start` reconnects immediately.
    pub async fn stop(&self) {
        if self.is_started() {
            self.close(PersistentStreamState::Stopped, None).await;
        }
    }

    /// After an error, makes the next `start` connect without waiting.
    pub fn inhibit_backoff(&self) {
        let mut state = self.inner.lock();
        if matches!(
            state.state,
            PersistentStreamState::Starting
                | PersistentStreamState::Backoff
                | PersistentStreamState::Open
                | PersistentStreamState::Healthy
        ) {
            log::debug!("{} stream: cannot inhibit backoff of a started stream", self.inner.kind.as_str());
            return;
        }
        state.state = PersistentStreamState::Initial;
        state.backoff.reset();
    }

    fn perform_backoff(&self) {
        let delay = {
            let mut state = self.inner.lock();
            state.state = PersistentStreamState::Backoff;
            state.backoff.next_delay()
        };
        log::debug!("{} stream: reconnecting in {delay:?}", self.label());
        let weak = Arc::downgrade(&self.inner);
        let timer = self.inner.context.queue.enqueue_after_delay(
            self.inner.timers.connection_backoff,
            delay,
            move || async move {
                if let Some(stream) = PersistentStream::from_weak(&weak) {
                    let ready = {
                        let mut state = stream.inner.lock();
                        state.backoff_timer = None;
                        if state.state == PersistentStreamState::Backoff {
                            state.state = PersistentStreamState::Initial;
                            true
                        } else {
                            false
                        }
                    };
                    if ready {
                        stream.start();
                    }
                }
                Ok(())
            },
        );
        self.inner.lock().backoff_timer = Some(timer);
    }

    async fn close(&self, final_state: PersistentStreamState, error: Option<FirestoreError>) {
        let (handle, invalidate_tokens) = {
            let mut state = self.inner.lock();
            for timer in [
                state.idle_timer.take(),
                state.health_timer.take(),
                state.backoff_timer.take(),
            ]
            .into_iter()
            .flatten()
            {
                timer.cancel();
            }
            state.close_count += 1;

            let mut invalidate_tokens = false;
            let code = error.as_ref().map(|error| error.code);
            if final_state != PersistentStreamState::Error {
                state.backoff.reset();
            } else if code == Some(FirestoreErrorCode::ResourceExhausted) {
                log::warn!("{} stream: backend resources exhausted, backing off to the maximum delay", self.label());
                state.backoff.reset_to_max();
            } else if code == Some(FirestoreErrorCode::Unauthenticated)
                && state.state != PersistentStreamState::Healthy
            {
                invalidate_tokens = true;
            }
            state.state = final_state;
            (state.handle.take(), invalidate_tokens)
        };

        if invalidate_tokens {
            log::debug!("{} stream: invalidating credentials after unauthenticated close", self.label());
            self.inner.context.auth.invalidate_token();
            self.inner.context.app_check.invalidate_token();
        }
        if let Some(handle) = handle {
            if let Err(err) = handle.close().await {
                log::debug!("{} stream: close failed: {err}", self.label());
            }
        }
        if let Err(err) = self.inner.delegate.on_close(error).await {
            log::warn!("{} stream: close handler failed: {err}", self.label());
        }
    }

    fn label(&self) -> &'static str {
        self.inner.kind.as_str()
    }

    #[cfg(test)]
    pub(crate) fn current_close_count(&self) -> u64 {
        self.close_count()
    }
}

/// Runs `operation` on the queue unless the stream closed (or was dropped)
/// since `close_count` was captured.
fn enqueue_guarded<F, Fut>(weak: &Weak<StreamInner>, close_count: u64, operation: F)
where
    F: FnOnce(PersistentStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let Some(stream) = PersistentStream::from_weak(weak) else {
        return;
    };
    let queue = stream.inner.context.queue.clone();
    let weak = weak.clone();
    drop(stream);
    queue.enqueue_and_forget(move || async move {
        if let Some(stream) = PersistentStream::from_weak(&weak) {
            if stream.close_count() == close_count {
                operation(stream).await;
            }
        }
        Ok(())
    });
}
