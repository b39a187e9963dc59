pub mod backoff;

pub use backoff::{BackoffSettings, ExponentialBackoff};
