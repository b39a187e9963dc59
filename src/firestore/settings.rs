//! Client configuration.
//!
//! Every tunable of the sync engine lives here with its default; components
//! receive the slice they need when the client is assembled.

use std::time::Duration;

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::QueryEngineSettings;
use crate::util::backoff::BackoffSettings;

/// Default number of limbo documents resolved concurrently.
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;
/// Default idle period before an unused stream is closed (60 seconds).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Default wait for the first message on a freshly opened stream (10 seconds).
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
/// Default wait before an unanswered watch stream counts as offline (10 seconds).
pub const DEFAULT_ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default number of write batches in flight on the write stream.
pub const DEFAULT_MAX_PENDING_WRITES: usize = 10;
/// Default number of attempts a transaction gets.
pub const DEFAULT_TRANSACTION_MAX_ATTEMPTS: u32 = 5;

#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreSettings {
    max_concurrent_limbo_resolutions: usize,
    backoff: BackoffSettings,
    idle_timeout: Duration,
    health_check_timeout: Duration,
    online_state_timeout: Duration,
    max_pending_writes: usize,
    query_engine: QueryEngineSettings,
    transaction_max_attempts: u32,
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            backoff: BackoffSettings::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            health_check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            online_state_timeout: DEFAULT_ONLINE_STATE_TIMEOUT,
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
            query_engine: QueryEngineSettings::default(),
            transaction_max_attempts: DEFAULT_TRANSACTION_MAX_ATTEMPTS,
        }
    }
}

impl FirestoreSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent_limbo_resolutions(mut self, value: usize) -> Self {
        self.max_concurrent_limbo_resolutions = value;
        self
    }

    pub fn with_initial_backoff(mut self, value: Duration) -> Self {
        self.backoff.initial_delay = value;
        self
    }

    pub fn with_backoff_factor(mut self, value: f64) -> Self {
        self.backoff.backoff_factor = value;
        self
    }

    pub fn with_max_backoff(mut self, value: Duration) -> Self {
        self.backoff.max_delay = value;
        self
    }

    pub fn with_idle_timeout(mut self, value: Duration) -> Self {
        self.idle_timeout = value;
        self
    }

    pub fn with_health_check_timeout(mut self, value: Duration) -> Self {
        self.health_check_timeout = value;
        self
    }

    pub fn with_online_state_timeout(mut self, value: Duration) -> Self {
        self.online_state_timeout = value;
        self
    }

    pub fn with_max_pending_writes(mut self, value: usize) -> Self {
        self.max_pending_writes = value;
        self
    }

    pub fn with_auto_index_min_documents(mut self, value: usize) -> Self {
        self.query_engine.auto_index_min_documents = value;
        self
    }

    pub fn with_relative_index_read_cost_per_document(mut self, value: f64) -> Self {
        self.query_engine.relative_index_read_cost_per_document = value;
        self
    }

    pub fn with_index_auto_creation_enabled(mut self, value: bool) -> Self {
        self.query_engine.index_auto_creation_enabled = value;
        self
    }

    pub fn with_transaction_max_attempts(mut self, value: u32) -> Self {
        self.transaction_max_attempts = value;
        self
    }

    /// Rejects combinations the engine cannot run with.
    pub fn validate(&self) -> FirestoreResult<()> {
        if self.max_concurrent_limbo_resolutions == 0 {
            return Err(invalid_argument(
                "max_concurrent_limbo_resolutions must be greater than zero",
            ));
        }
        if self.max_pending_writes == 0 {
            return Err(invalid_argument("max_pending_writes must be greater than zero"));
        }
        if self.transaction_max_attempts == 0 {
            return Err(invalid_argument("transaction_max_attempts must be at least 1"));
        }
        if !(self.backoff.backoff_factor >= 1.0) {
            return Err(invalid_argument("backoff_factor must be at least 1.0"));
        }
        if self.backoff.max_delay < self.backoff.initial_delay {
            return Err(invalid_argument("max_backoff must not be below initial_backoff"));
        }
        Ok(())
    }

    pub fn max_concurrent_limbo_resolutions(&self) -> usize {
        self.max_concurrent_limbo_resolutions
    }

    pub fn backoff(&self) -> BackoffSettings {
        self.backoff
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn health_check_timeout(&self) -> Duration {
        self.health_check_timeout
    }

    pub fn online_state_timeout(&self) -> Duration {
        self.online_state_timeout
    }

    pub fn max_pending_writes(&self) -> usize {
        self.max_pending_writes
    }

    pub fn query_engine(&self) -> QueryEngineSettings {
        self.query_engine
    }

    pub fn transaction_max_attempts(&self) -> u32 {
        self.transaction_max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = FirestoreSettings::default();
        assert_eq!(settings.max_concurrent_limbo_resolutions(), 100);
        assert_eq!(settings.backoff().initial_delay, Duration::from_secs(1));
        assert_eq!(settings.backoff().max_delay, Duration::from_secs(60));
        assert_eq!(settings.idle_timeout(), Duration::from_secs(60));
        assert_eq!(settings.health_check_timeout(), Duration::from_secs(10));
        assert_eq!(settings.max_pending_writes(), 10);
        assert_eq!(settings.transaction_max_attempts(), 5);
        assert!(!settings.query_engine().index_auto_creation_enabled);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn rejects_zero_limbo_capacity() {
        let settings = FirestoreSettings::new().with_max_concurrent_limbo_resolutions(0);
        assert!(settings.validate().is_err());
    }
}
