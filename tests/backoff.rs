use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use firestore_sync::util::backoff::{BackoffSettings, ExponentialBackoff};

const CEILING: Duration = Duration::from_millis(60_000);

fn within_jitter(delay: Duration, base: Duration) -> bool {
    let base = base.as_millis() as f64;
    let delay = delay.as_millis() as f64;
    delay >= base * 0.5 && delay <= base * 1.5
}

#[test]
fn repeated_resource_exhaustion_keeps_delays_at_the_ceiling() {
    for seed in 0..20 {
        let mut backoff = ExponentialBackoff::with_rng(BackoffSettings::default(), StdRng::seed_from_u64(seed));
        let mut delays = Vec::new();
        for _ in 0..10 {
            // Every failed attempt reports exhausted resources.
            backoff.reset_to_max();
            delays.push(backoff.next_delay());
        }
        let tenth = delays[9];
        assert!(within_jitter(tenth, CEILING), "seed {seed}: tenth delay {tenth:?}");
    }
}

#[test]
fn ordinary_failures_grow_towards_the_ceiling() {
    let mut backoff = ExponentialBackoff::with_rng(BackoffSettings::default(), StdRng::seed_from_u64(11));
    assert_eq!(backoff.next_delay(), Duration::ZERO);

    let mut bases = Vec::new();
    for _ in 0..10 {
        bases.push(backoff.current_base());
        let delay = backoff.next_delay();
        assert!(delay <= CEILING.mul_f64(1.5));
    }
    assert_eq!(bases[0], Duration::from_millis(1_000));
    assert_eq!(bases[1], Duration::from_millis(2_000));
    assert!(bases.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(*bases.last().unwrap(), CEILING);
}
