mod async_queue;

pub use async_queue::{AsyncQueue, DelayedOperation, TimerId};
