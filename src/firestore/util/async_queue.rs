use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender};
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::firestore::error::{
    cancelled, failed_precondition, internal_error, FirestoreErrorCode, FirestoreError,
    FirestoreResult,
};
use crate::platform::runtime;
use crate::util::backoff::{BackoffSettings, ExponentialBackoff};

type QueueOperation = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;
type RetryableOperation = Arc<dyn Fn() -> BoxFuture<'static, FirestoreResult<()>> + Send + Sync>;

/// Identifies the kind of a delayed operation so tests can run timers
/// deterministically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// Matches every timer in [`AsyncQueue::run_all_delayed_operations_until`].
    All,
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    HealthCheckTimeout,
    OnlineStateTimeout,
    TransactionRetry,
    AsyncQueueRetry,
    IndexBackfill,
    GarbageCollection,
}

struct DelayedEntry {
    id: u64,
    timer_id: TimerId,
    target_time: Instant,
    operation: QueueOperation,
}

struct QueueState {
    delayed: Vec<DelayedEntry>,
    restricted: bool,
    retryable: VecDeque<RetryableOperation>,
    retry_backoff: ExponentialBackoff,
}

struct AsyncQueueInner {
    sender: Sender<QueueOperation>,
    state: Mutex<QueueState>,
    operation_in_progress: Arc<AtomicBool>,
    next_delayed_id: AtomicU64,
}

impl AsyncQueueInner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fire_delayed(&self, id: u64) {
        let entry = {
            let mut state = self.state();
            if state.restricted {
                return;
            }
            let Some(position) = state.delayed.iter().position(|entry| entry.id == id) else {
                return;
            };
            state.delayed.remove(position)
        };
        if self.sender.try_send(entry.operation).is_err() {
            log::debug!("async queue: dropping delayed operation, queue is closed");
        }
    }
}

/// Serial executor for every operation that touches client state. Operations
/// run one at a time in submission order on a single worker task.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<AsyncQueueInner>,
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncQueue {
    pub fn new() -> Self {
        Self::with_backoff(ExponentialBackoff::new(BackoffSettings::default()))
    }

    /// Queue whose retry backoff is `retry_backoff`.
    pub fn with_backoff(retry_backoff: ExponentialBackoff) -> Self {
        let (sender, receiver) = async_channel::unbounded();
        let operation_in_progress = Arc::new(AtomicBool::new(false));
        runtime::spawn_detached(run_worker(receiver, Arc::clone(&operation_in_progress)));
        Self {
            inner: Arc::new(AsyncQueueInner {
                sender,
                state: Mutex::new(QueueState {
                    delayed: Vec::new(),
                    restricted: false,
                    retryable: VecDeque::new(),
                    retry_backoff,
                }),
                operation_in_progress,
                next_delayed_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state().restricted
    }

    /// Runs `operation` after everything queued before it and resolves with
    /// its result. Fails with `failed-precondition` once the queue is
    /// restricted.
    pub fn enqueue<F, Fut, T>(&self, operation: F) -> impl Future<Output = FirestoreResult<T>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let receiver = if self.is_shutting_down() {
            Err(failed_precondition("The client has already been terminated."))
        } else {
            Ok(self.push(operation))
        };
        async move { receive(receiver?).await }
    }

    /// Like [`enqueue`](Self::enqueue), but accepted after the queue entered
    /// restricted mode.
    pub fn enqueue_even_while_restricted<F, Fut, T>(
        &self,
        operation: F,
    ) -> impl Future<Output = FirestoreResult<T>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let receiver = self.push(operation);
        receive(receiver)
    }

    /// Queues `operation` without waiting for it. Failures are logged.
    pub fn enqueue_and_forget<F, Fut>(&self, operation: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        if self.is_shutting_down() {
            log::debug!("async queue: ignoring operation submitted after shutdown");
            return;
        }
        self.send(logged(operation));
    }

    /// Restricts the queue and runs `operation` as the last accepted
    /// operation. Pending delayed operations are dropped.
    pub fn enqueue_and_initiate_shutdown<F, Fut>(&self, operation: F) -> impl Future<Output = FirestoreResult<()>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let already_restricted = {
            let mut state = self.inner.state();
            let already = state.restricted;
            state.restricted = true;
            state.delayed.clear();
            state.retryable.clear();
            already
        };
        let receiver = if already_restricted {
            None
        } else {
            Some(self.push(operation))
        };
        async move {
            match receiver {
                Some(receiver) => receive(receiver).await,
                None => Ok(()),
            }
        }
    }

    /// Rejects ordinary operations from now on.
    pub fn enter_restricted_mode(&self) {
        self.inner.state().restricted = true;
    }

    /// Schedules `operation` to enter the queue after `delay`. The returned
    /// handle cancels it synchronously.
    pub fn enqueue_after_delay<F, Fut>(&self, timer_id: TimerId, delay: Duration, operation: F) -> DelayedOperation
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let id = self.inner.next_delayed_id.fetch_add(1, Ordering::SeqCst);
        let target_time = Instant::now() + delay;
        self.inner.state().delayed.push(DelayedEntry {
            id,
            timer_id,
            target_time,
            operation: logged(operation),
        });

        let weak = Arc::downgrade(&self.inner);
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire_delayed(id);
            }
        });

        DelayedOperation {
            id,
            timer_id,
            target_time,
            queue: Arc::downgrade(&self.inner),
        }
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.inner
            .state()
            .delayed
            .iter()
            .any(|entry| timer_id == TimerId::All || entry.timer_id == timer_id)
    }

    /// Runs pending delayed operations in target-time order without waiting
    /// for their delays, stopping after the first one with
    /// `last_timer_id`.
    pub async fn run_all_delayed_operations_until(&self, last_timer_id: TimerId) -> FirestoreResult<()> {
        self.drain().await?;
        let mut scheduled: Vec<(Instant, u64, TimerId)> = self
            .inner
            .state()
            .delayed
            .iter()
            .map(|entry| (entry.target_time, entry.id, entry.timer_id))
            .collect();
        scheduled.sort();

        for (_, id, timer_id) in scheduled {
            self.inner.fire_delayed(id);
            self.drain().await?;
            if last_timer_id != TimerId::All && timer_id == last_timer_id {
                break;
            }
        }
        Ok(())
    }

    /// Resolves once every operation queued so far has run.
    pub async fn drain(&self) -> FirestoreResult<()> {
        self.enqueue_even_while_restricted(|| async { Ok(()) }).await
    }

    /// Fails unless called from inside a queued operation.
    pub fn verify_operation_in_progress(&self) -> FirestoreResult<()> {
        if self.inner.operation_in_progress.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(internal_error("Expected to be called by the async queue"))
        }
    }

    /// Queues an operation that is retried with backoff until it stops
    /// failing with a transient persistence error. Retryable operations run
    /// one at a time in submission order.
    pub fn enqueue_retryable<F, Fut>(&self, operation: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        if self.is_shutting_down() {
            return;
        }
        let operation: RetryableOperation = Arc::new(move || operation().boxed());
        let first = {
            let mut state = self.inner.state();
            state.retryable.push_back(operation);
            state.retryable.len() == 1
        };
        if first {
            self.run_next_retryable();
        }
    }

    fn run_next_retryable(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.send(Box::new(move || match weak.upgrade() {
            Some(inner) => AsyncQueue { inner }.attempt_retryable(),
            None => futures::future::ready(()).boxed(),
        }));
    }

    fn attempt_retryable(self) -> BoxFuture<'static, ()> {
        async move {
            let Some(operation) = self.inner.state().retryable.front().cloned() else {
                return;
            };
            match operation().await {
                Ok(()) => self.finish_retryable(),
                Err(error) if is_retryable_queue_error(&error) => {
                    let delay = self.inner.state().retry_backoff.next_delay();
                    log::debug!("async queue: retrying operation in {delay:?} after {error}");
                    let weak: Weak<AsyncQueueInner> = Arc::downgrade(&self.inner);
                    self.enqueue_after_delay(TimerId::AsyncQueueRetry, delay, move || async move {
                        if let Some(inner) = weak.upgrade() {
                            AsyncQueue { inner }.attempt_retryable().await;
                        }
                        Ok(())
                    });
                }
                Err(error) => {
                    log::error!("async queue: retryable operation failed permanently: {error}");
                    self.finish_retryable();
                }
            }
        }
        .boxed()
    }

    fn finish_retryable(&self) {
        let more = {
            let mut state = self.inner.state();
            state.retryable.pop_front();
            state.retry_backoff.reset();
            !state.retryable.is_empty()
        };
        if more {
            self.run_next_retryable();
        }
    }

    fn push<F, Fut, T>(&self, operation: F) -> oneshot::Receiver<FirestoreResult<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        self.send(Box::new(move || {
            async move {
                let _ = sender.send(operation().await);
            }
            .boxed()
        }));
        receiver
    }

    fn send(&self, operation: QueueOperation) {
        if self.inner.sender.try_send(operation).is_err() {
            log::debug!("async queue: worker stopped, dropping operation");
        }
    }
}

/// Handle to an operation scheduled with
/// [`AsyncQueue::enqueue_after_delay`].
#[derive(Clone)]
pub struct DelayedOperation {
    id: u64,
    timer_id: TimerId,
    target_time: Instant,
    queue: Weak<AsyncQueueInner>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    pub fn target_time(&self) -> Instant {
        self.target_time
    }

    /// Removes the operation if it has not entered the queue yet.
    pub fn cancel(&self) {
        if let Some(inner) = self.queue.upgrade() {
            inner.state().delayed.retain(|entry| entry.id != self.id);
        }
    }
}

impl std::fmt::Debug for DelayedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedOperation")
            .field("id", &self.id)
            .field("timer_id", &self.timer_id)
            .finish()
    }
}

fn is_retryable_queue_error(error: &FirestoreError) -> bool {
    error.is_primary_lease_lost() || error.code == FirestoreErrorCode::Unavailable
}

fn logged<F, Fut>(operation: F) -> QueueOperation
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
{
    Box::new(move || {
        async move {
            if let Err(err) = operation().await {
                log::error!("async queue: operation failed: {err}");
            }
        }
        .boxed()
    })
}

async fn receive<T>(receiver: oneshot::Receiver<FirestoreResult<T>>) -> FirestoreResult<T> {
    receiver
        .await
        .map_err(|_| cancelled("The operation was dropped before it completed"))?
}

async fn run_worker(receiver: Receiver<QueueOperation>, in_progress: Arc<AtomicBool>) {
    while let Ok(operation) = receiver.recv().await {
        in_progress.store(true, Ordering::SeqCst);
        operation().await;
        in_progress.store(false, Ordering::SeqCst);
    }
}
