use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;

use crate::firestore::core::transaction::Transaction;
use crate::firestore::error::{cancelled, invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::remote::Datastore;
use crate::firestore::util::{AsyncQueue, TimerId};
use crate::util::backoff::{BackoffSettings, ExponentialBackoff};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Runs a transaction update function against the backend, retrying with a
/// fresh [`Transaction`] while the failure is one a retry can fix.
pub struct TransactionRunner {
    queue: AsyncQueue,
    datastore: Arc<dyn Datastore>,
    max_attempts: u32,
    backoff: ExponentialBackoff,
}

impl TransactionRunner {
    pub fn new(
        queue: AsyncQueue,
        datastore: Arc<dyn Datastore>,
        max_attempts: u32,
        backoff_settings: BackoffSettings,
    ) -> FirestoreResult<Self> {
        if max_attempts == 0 {
            return Err(invalid_argument("Max attempts must be at least 1"));
        }
        Ok(Self {
            queue,
            datastore,
            max_attempts,
            backoff: ExponentialBackoff::new(backoff_settings),
        })
    }

    /// Calls `update_fn` with a new transaction and commits what it wrote.
    /// The update function may run several times; its result is returned
    /// from the attempt that committed.
    pub async fn run<T, F, Fut>(mut self, mut update_fn: F) -> FirestoreResult<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = FirestoreResult<T>>,
    {
        let mut attempts_remaining = self.max_attempts;
        loop {
            attempts_remaining -= 1;
            self.wait_for_backoff().await?;

            let transaction = Transaction::new(Arc::clone(&self.datastore));
            let result = match update_fn(transaction.clone()).await {
                Ok(value) => transaction.commit().await.map(|_| value),
                Err(error) => Err(error),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(error) if attempts_remaining > 0 && is_retryable(&error) => {
                    log::debug!(
                        "transaction runner: attempt failed with {error}, {attempts_remaining} attempt(s) left"
                    );
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn wait_for_backoff(&mut self) -> FirestoreResult<()> {
        let delay = self.backoff.next_delay();
        if delay == Duration::ZERO {
            return Ok(());
        }

        let (sender, receiver) = oneshot::channel();
        // A terminated queue drops the timer, and with it the sender.
        self.queue.enqueue_after_delay(TimerId::TransactionRetry, delay, move || async move {
            let _ = sender.send(());
            Ok(())
        });
        receiver
            .await
            .map_err(|_| cancelled("The client was terminated while a transaction was waiting to retry"))
    }
}

fn is_retryable(error: &FirestoreError) -> bool {
    error.code.is_retryable_transaction_error()
}
