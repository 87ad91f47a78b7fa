use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::config::RateLimit;

/// Something upstream calls must acquire tokens from before being sent
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Wait up to `timeout` for `tokens`. Returns false when the wait timed out.
    async fn acquire(&self, tokens: f64, timeout: Duration) -> bool;
}

/// In-process token bucket
///
/// This implementation provides:
/// - Smooth rate limiting with configurable refill rate
/// - Burst capacity equal to the per-period count
#[derive(Clone)]
pub struct TokenBucket {
    inner: Arc<Mutex<TokenBucketInner>>,
    capacity: f64,
    refill_rate: f64, // tokens per second
}

struct TokenBucketInner {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a new token bucket
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of tokens (burst capacity)
    /// * `refill_rate` - Tokens added per second
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        // Ensure refill_rate is not zero to prevent division by zero
        let refill_rate = if refill_rate > 0.0 { refill_rate } else { 1.0 };

        Self {
            inner: Arc::new(Mutex::new(TokenBucketInner {
                tokens: capacity, // Start full
                last_refill: Instant::now(),
            })),
            capacity,
            refill_rate,
        }
    }

    pub fn from_rate(limit: RateLimit) -> Self {
        Self::new(limit.count as f64, limit.per_second())
    }

    /// Try to acquire tokens immediately
    pub async fn try_acquire(&self, tokens: f64) -> Result<(), ()> {
        let mut inner = self.inner.lock().await;

        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
        inner.tokens = (inner.tokens + elapsed * self.refill_rate).min(self.capacity);
        inner.last_refill = now;

        trace!(
            "Token bucket: {} tokens available, requesting {}",
            inner.tokens,
            tokens
        );

        if inner.tokens >= tokens {
            inner.tokens -= tokens;
            debug!(
                "Token bucket: acquired {} tokens, {} remaining",
                tokens, inner.tokens
            );
            Ok(())
        } else {
            Err(())
        }
    }

    /// Acquire tokens, waiting at most `timeout`
    pub async fn acquire_timeout(
        &self,
        tokens: f64,
        timeout: Duration,
    ) -> Result<(), tokio::time::error::Elapsed> {
        tokio::time::timeout(timeout, async {
            loop {
                if self.try_acquire(tokens).await.is_ok() {
                    return;
                }

                let wait = {
                    let inner = self.inner.lock().await;
                    let needed = (tokens - inner.tokens).max(0.0);
                    Duration::from_secs_f64(needed / self.refill_rate)
                        .clamp(Duration::from_millis(1), Duration::from_millis(100))
                };

                tokio::time::sleep(wait).await;
            }
        })
        .await
    }

    /// Get current available tokens (for monitoring)
    pub async fn available_tokens(&self) -> f64 {
        let mut inner = self.inner.lock().await;

        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
        inner.tokens = (inner.tokens + elapsed * self.refill_rate).min(self.capacity);
        inner.last_refill = now;

        inner.tokens
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    async fn acquire(&self, tokens: f64, timeout: Duration) -> bool {
        self.acquire_timeout(tokens, timeout).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_bucket_basic() {
        let bucket = TokenBucket::new(10.0, 5.0); // 10 capacity, 5 per second

        // Should succeed - bucket starts full
        assert!(bucket.try_acquire(5.0).await.is_ok());
        assert!(bucket.try_acquire(5.0).await.is_ok());

        // Should fail - no tokens left
        assert!(bucket.try_acquire(1.0).await.is_err());

        // Wait for refill
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Should have ~1.5 tokens now
        assert!(bucket.try_acquire(1.0).await.is_ok());
    }

    #[tokio::test]
    async fn test_token_bucket_refill() {
        let bucket = TokenBucket::new(10.0, 10.0);

        assert!(bucket.try_acquire(10.0).await.is_ok());

        tokio::time::sleep(Duration::from_millis(500)).await;

        // Should have ~5 tokens
        let available = bucket.available_tokens().await;
        assert!((4.0..=6.0).contains(&available));
    }

    #[tokio::test]
    async fn test_acquire_waits_then_times_out() {
        let bucket = TokenBucket::from_rate("2/s".parse().unwrap());
        assert!(bucket.acquire(2.0, Duration::from_millis(10)).await);

        // One token refills in ~500ms
        assert!(!bucket.acquire(1.0, Duration::from_millis(50)).await);
        assert!(bucket.acquire(1.0, Duration::from_millis(1000)).await);
    }

    #[tokio::test]
    async fn test_refill_caps_at_capacity() {
        let bucket = TokenBucket::new(3.0, 100.0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let available = bucket.available_tokens().await;
        assert!(available <= 3.0);
    }
}
