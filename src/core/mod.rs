//! Core building blocks shared by the API and the workers

pub mod retry;
pub mod token_bucket;

pub use retry::{is_retryable_status, BackoffCalculator};
pub use token_bucket::{RateLimiter, TokenBucket};
