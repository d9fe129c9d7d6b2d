//! Token bucket limiter for outbound API calls.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Allows bursts up to one second's worth of requests and refills
/// continuously at `requests_per_minute / 60` tokens per second.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    capacity: f64,
    per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, requests_per_minute: u32) -> Self {
        let per_sec = f64::from(requests_per_minute.max(1)) / 60.0;
        let capacity = per_sec.ceil().max(1.0);
        Self {
            name: name.into(),
            capacity,
            per_sec,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take a token without waiting.
    pub async fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take a token, sleeping until one is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                let missing = 1.0 - bucket.tokens;
                Duration::from_secs_f64(missing / self.per_sec)
                    .clamp(Duration::from_millis(5), Duration::from_secs(1))
            };

            debug!(limiter = %self.name, wait_ms = wait.as_millis() as u64, "Throttling request");
            tokio::time::sleep(wait).await;
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * self.per_sec).min(self.capacity);
            bucket.last_refill = now;
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }
}

/// Shared rate limiter that can be cloned.
pub type SharedRateLimiter = Arc<RateLimiter>;

pub fn shared_limiter(name: impl Into<String>, requests_per_minute: u32) -> SharedRateLimiter {
    Arc::new(RateLimiter::new(name, requests_per_minute))
}

// ============================================================================
// Tests
// ============================================================================
