//! Shared throttle in front of the external API.
//!
//! Two limits apply to every person at once: a cap on operations in flight
//! (a semaphore permit held for a whole admit or evict) and a token bucket
//! that every individual external call draws from.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Take one token, or report how long until one is available.
    fn try_consume(&mut self, rate: f64, capacity: f64) -> Result<(), Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        self.tokens = (self.tokens + elapsed * rate).min(capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / rate))
        }
    }
}

#[derive(Clone)]
pub struct RateGate {
    ops: Arc<Semaphore>,
    bucket: Arc<Mutex<TokenBucket>>,
    rate: f64,
    capacity: f64,
}

impl RateGate {
    pub fn new(max_concurrent_ops: usize, rate: f64, capacity: f64) -> Self {
        let capacity = capacity.max(1.0);
        Self {
            ops: Arc::new(Semaphore::new(max_concurrent_ops.max(1))),
            bucket: Arc::new(Mutex::new(TokenBucket::new(capacity))),
            rate,
            capacity,
        }
    }

    /// Wait for an operation slot. The slot is released when the permit drops.
    pub async fn operation(&self) -> Option<OwnedSemaphorePermit> {
        // The semaphore is never closed, so this only fails in theory.
        self.ops.clone().acquire_owned().await.ok()
    }

    /// Wait until one external call may be issued.
    pub async fn call(&self) {
        if self.rate <= 0.0 {
            return;
        }
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                match bucket.try_consume(self.rate, self.capacity) {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };
            tracing::trace!(wait_ms = wait.as_millis() as u64, "api call throttled");
            tokio::time::sleep(wait).await;
        }
    }
}
