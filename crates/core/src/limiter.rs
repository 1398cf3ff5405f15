//! Token bucket pacing for response bodies.
//!
//! One bucket is created per response stream, so every reader gets its own
//! budget of `rate` bytes per second instead of sharing a global cap.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::io;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Bytes per second, 0 disables throttling
    rate: u64,
    capacity: u64,
    /// Current balance. Goes negative while a caller sleeps off a debit.
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(rate: u64, capacity: u64) -> Self {
        Self {
            rate,
            capacity,
            tokens: capacity as f64,
            last_refill: Instant::now(),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.capacity as f64);
        self.last_refill = now;
    }

    /// Debit `n` tokens and return how long the caller has to wait before the
    /// balance is back to zero.
    pub fn reserve(&mut self, n: u64) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }

        self.refill(Instant::now());
        self.tokens -= n as f64;

        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate as f64)
        }
    }

    /// Wait until `n` tokens are available and consume them. Only the calling
    /// task sleeps.
    pub async fn take(&mut self, n: u64) {
        let wait = self.reserve(n);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Pace a byte stream through `bucket`. Each chunk is delayed until the
/// bucket covers its length.
pub fn throttle<S>(stream: S, mut bucket: TokenBucket) -> impl Stream<Item = io::Result<Bytes>>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    async_stream::stream! {
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            if let Ok(chunk) = &item {
                bucket.take(chunk.len() as u64).await;
            }
            yield item;
        }
    }
}
