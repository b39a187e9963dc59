use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::firestore::error::FirestoreError;
use crate::firestore::util::{AsyncQueue, DelayedOperation, TimerId};

/// Failed watch stream attempts, without a successful message in between,
/// after which the client reports itself offline.
pub const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OnlineState {
    /// Connecting; listeners keep waiting for server data.
    Unknown,
    /// The watch stream delivered a message.
    Online,
    /// Listeners are served from cache until the connection recovers.
    Offline,
}

pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) -> BoxFuture<'static, ()> + Send + Sync>;

struct TrackerState {
    state: OnlineState,
    watch_stream_failures: u32,
    online_state_timer: Option<DelayedOperation>,
    should_warn_client_is_offline: bool,
}

struct TrackerInner {
    queue: AsyncQueue,
    timeout: Duration,
    handler: OnlineStateHandler,
    state: Mutex<TrackerState>,
}

/// Derives the [`OnlineState`] from watch stream health and broadcasts every
/// change to its handler.
///
/// Starting the watch stream moves to `Unknown` and arms a timer; when the
/// timer fires before the first message the state becomes `Offline`. A
/// failed attempt also moves to `Offline` once [`MAX_WATCH_STREAM_FAILURES`]
/// is reached, and a failure while `Online` drops back to `Unknown`.
#[derive(Clone)]
pub struct OnlineStateTracker {
    inner: Arc<TrackerInner>,
}

impl OnlineStateTracker {
    pub fn new(queue: AsyncQueue, timeout: Duration, handler: OnlineStateHandler) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                queue,
                timeout,
                handler,
                state: Mutex::new(TrackerState {
                    state: OnlineState::Unknown,
                    watch_stream_failures: 0,
                    online_state_timer: None,
                    should_warn_client_is_offline: true,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> OnlineState {
        self.lock().state
    }

    pub fn watch_stream_failures(&self) -> u32 {
        self.lock().watch_stream_failures
    }

    /// Called every time the watch stream starts connecting.
    pub async fn handle_watch_stream_start(&self) {
        let first_attempt = self.lock().watch_stream_failures == 0;
        if !first_attempt {
            return;
        }
        self.set_and_broadcast(OnlineState::Unknown).await;

        let tracker = self.clone();
        let timer = self.inner.queue.enqueue_after_delay(
            TimerId::OnlineStateTimeout,
            self.inner.timeout,
            move || async move {
                tracker.lock().online_state_timer = None;
                tracker.log_offline_warning(&format!(
                    "Backend didn't respond within {} seconds.",
                    tracker.inner.timeout.as_secs()
                ));
                tracker.set_and_broadcast(OnlineState::Offline).await;
                Ok(())
            },
        );
        if let Some(previous) = self.lock().online_state_timer.replace(timer) {
            previous.cancel();
        }
    }

    /// Called when the watch stream closed with an error.
    pub async fn handle_watch_stream_failure(&self, error: Option<&FirestoreError>) {
        if self.state() == OnlineState::Online {
            self.set_and_broadcast(OnlineState::Unknown).await;
            return;
        }

        let reached_limit = {
            let mut state = self.lock();
            state.watch_stream_failures += 1;
            state.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES
        };
        if reached_limit {
            self.clear_online_state_timer();
            let reason = match error {
                Some(error) => format!("Connection failed {MAX_WATCH_STREAM_FAILURES} times. Most recent error: {error}"),
                None => format!("Connection failed {MAX_WATCH_STREAM_FAILURES} times."),
            };
            self.log_offline_warning(&reason);
            self.set_and_broadcast(OnlineState::Offline).await;
        }
    }

    /// Forces `new_state`, clearing the failure count and any pending timer.
    pub async fn set(&self, new_state: OnlineState) {
        self.clear_online_state_timer();
        {
            let mut state = self.lock();
            state.watch_stream_failures = 0;
            if new_state == OnlineState::Online {
                state.should_warn_client_is_offline = false;
            }
        }
        self.set_and_broadcast(new_state).await;
    }

    async fn set_and_broadcast(&self, new_state: OnlineState) {
        let changed = {
            let mut state = self.lock();
            let changed = state.state != new_state;
            state.state = new_state;
            changed
        };
        if changed {
            (self.inner.handler)(new_state).await;
        }
    }

    fn clear_online_state_timer(&self) {
        if let Some(timer) = self.lock().online_state_timer.take() {
            timer.cancel();
        }
    }

    fn log_offline_warning(&self, details: &str) {
        let mut state = self.lock();
        if state.should_warn_client_is_offline {
            log::warn!(
                "Could not reach the backend. {details} The client will operate in offline mode until it can connect."
            );
            state.should_warn_client_is_offline = false;
        } else {
            log::debug!("online state: {details}");
        }
    }
}
