use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(60_000);
/// Delays are jittered by up to this fraction of the base delay, either way.
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSettings {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Exponential backoff with jitter. The first delay after a reset is zero;
/// each following delay grows the base by `backoff_factor`, clamped to
/// `[initial_delay, max_delay]`.
#[derive(Debug)]
pub struct ExponentialBackoff {
    settings: BackoffSettings,
    current_base_millis: f64,
    rng: StdRng,
}

impl ExponentialBackoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self::with_rng(settings, StdRng::from_entropy())
    }

    pub fn with_rng(settings: BackoffSettings, rng: StdRng) -> Self {
        Self {
            settings,
            current_base_millis: 0.0,
            rng,
        }
    }

    pub fn settings(&self) -> &BackoffSettings {
        &self.settings
    }

    /// Next attempt happens without delay.
    pub fn reset(&mut self) {
        self.current_base_millis = 0.0;
    }

    /// Next attempt waits the maximum delay, used when the backend reports
    /// exhausted resources.
    pub fn reset_to_max(&mut self) {
        self.current_base_millis = self.settings.max_delay.as_millis() as f64;
    }

    /// Base delay the next call to [`next_delay`](Self::next_delay) jitters.
    pub fn current_base(&self) -> Duration {
        Duration::from_millis(self.current_base_millis as u64)
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = jittered_delay_millis(self.current_base_millis, &mut self.rng);

        let initial = self.settings.initial_delay.as_millis() as f64;
        let max = self.settings.max_delay.as_millis() as f64;
        self.current_base_millis =
            (self.current_base_millis * self.settings.backoff_factor).clamp(initial, max.max(initial));

        Duration::from_millis(delay)
    }
}

fn jittered_delay_millis<R: Rng + ?Sized>(base_millis: f64, rng: &mut R) -> u64 {
    let jitter = RANDOM_FACTOR * base_millis * rng.gen_range(-1.0..=1.0);
    (base_millis + jitter).round().max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(seed: u64) -> ExponentialBackoff {
        ExponentialBackoff::with_rng(BackoffSettings::default(), StdRng::seed_from_u64(seed))
    }

    #[test]
    fn first_attempt_is_immediate() {
        let mut backoff = seeded(7);
        assert_eq!(backoff.next_delay(), Duration::ZERO);
        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(500) && second <= Duration::from_millis(1_500));
    }

    #[test]
    fn delays_never_exceed_the_jittered_ceiling() {
        let mut backoff = seeded(42);
        for _ in 0..20 {
            assert!(backoff.next_delay() <= Duration::from_millis(90_000));
        }
        assert_eq!(backoff.current_base(), DEFAULT_MAX_DELAY);
    }

    #[test]
    fn reset_to_max_starts_at_the_ceiling() {
        let mut backoff = seeded(3);
        backoff.reset_to_max();
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_millis(30_000));
        assert!(delay <= Duration::from_millis(90_000));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }
}
