//! Batch generation: shared rate limiting, retried calls and the sequential row runner.

pub mod batch;
pub mod rate_limit;
pub mod retry;
pub mod tracker;

pub use batch::{BatchRunner, BatchSettings};
pub use rate_limit::{RateLimiter, RateLimits};
pub use retry::{RetryPolicy, RetryingClient};
pub use tracker::{BatchState, BatchTracker};
