use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::debug;

/// Logical REST endpoint family. The candle and depth buckets are smaller
/// than the price bucket so hot clusters of kline/depth calls cannot starve
/// price refreshes into upstream throttling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Price,
    Candles,
    Depth,
    General,
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointClass::Price => "price",
            EndpointClass::Candles => "candles",
            EndpointClass::Depth => "depth",
            EndpointClass::General => "general",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limiter closed")]
    Closed,

    #[error("acquire cancelled by shutdown")]
    Cancelled,
}

struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

/// A single token bucket. Refills lazily: each acquire tops the bucket back
/// up to capacity once a full refill interval has elapsed.
pub struct TokenBucket {
    capacity: u32,
    refill_interval: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_interval,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Block until a token is available or the shutdown signal fires.
    pub async fn acquire(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), RateLimitError> {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed();
                if elapsed >= self.refill_interval {
                    state.tokens = self.capacity;
                    state.last_refill = Instant::now();
                }

                if state.tokens > 0 {
                    state.tokens -= 1;
                    return Ok(());
                }

                self.refill_interval.saturating_sub(elapsed)
            };

            tokio::select! {
                _ = tokio::time::sleep(wait.max(Duration::from_millis(10))) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Err(RateLimitError::Cancelled);
                    }
                }
            }
        }
    }
}

/// Process-wide pool of token buckets, one per endpoint class.
///
/// Owned by the supervisor: created once at startup, `close()` at teardown
/// blocks every further acquire.
pub struct RateLimiterPool {
    buckets: HashMap<EndpointClass, Arc<TokenBucket>>,
    closed: AtomicBool,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub price_per_sec: u32,
    pub candles_per_sec: u32,
    pub depth_per_sec: u32,
    pub general_per_sec: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            price_per_sec: 8,
            candles_per_sec: 5,
            depth_per_sec: 5,
            general_per_sec: 6,
        }
    }
}

impl RateLimiterPool {
    pub fn new(config: RateLimiterConfig) -> Self {
        let interval = Duration::from_secs(1);
        let mut buckets = HashMap::new();
        buckets.insert(
            EndpointClass::Price,
            Arc::new(TokenBucket::new(config.price_per_sec, interval)),
        );
        buckets.insert(
            EndpointClass::Candles,
            Arc::new(TokenBucket::new(config.candles_per_sec, interval)),
        );
        buckets.insert(
            EndpointClass::Depth,
            Arc::new(TokenBucket::new(config.depth_per_sec, interval)),
        );
        buckets.insert(
            EndpointClass::General,
            Arc::new(TokenBucket::new(config.general_per_sec, interval)),
        );
        Self {
            buckets,
            closed: AtomicBool::new(false),
        }
    }

    pub async fn acquire(
        &self,
        class: EndpointClass,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), RateLimitError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RateLimitError::Closed);
        }
        let bucket = self
            .buckets
            .get(&class)
            .or_else(|| self.buckets.get(&EndpointClass::General))
            .expect("general bucket always present");
        bucket.acquire(shutdown).await
    }

    /// Teardown: every subsequent acquire fails fast.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        debug!("RateLimiterPool: closed, further acquires will be rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shutdown_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn never_exceeds_capacity_within_one_interval() {
        let bucket = TokenBucket::new(3, Duration::from_secs(60));
        let (_tx, mut rx) = shutdown_pair();

        let start = Instant::now();
        for _ in 0..3 {
            bucket.acquire(&mut rx).await.unwrap();
        }
        // All capacity consumed instantly
        assert!(start.elapsed() < Duration::from_millis(100));

        // A fourth acquire must wait for the refill, so it cannot complete
        // within the same interval
        let fourth = tokio::time::timeout(Duration::from_millis(200), bucket.acquire(&mut rx));
        assert!(fourth.await.is_err());
    }

    #[tokio::test]
    async fn refills_after_interval() {
        let bucket = TokenBucket::new(1, Duration::from_millis(50));
        let (_tx, mut rx) = shutdown_pair();

        bucket.acquire(&mut rx).await.unwrap();
        let start = Instant::now();
        bucket.acquire(&mut rx).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn acquire_unblocks_on_shutdown() {
        let bucket = TokenBucket::new(1, Duration::from_secs(60));
        let (tx, mut rx) = shutdown_pair();

        bucket.acquire(&mut rx).await.unwrap();

        let handle = tokio::spawn(async move { bucket.acquire(&mut rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RateLimitError::Cancelled)));
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquires() {
        let pool = RateLimiterPool::new(RateLimiterConfig::default());
        let (_tx, mut rx) = shutdown_pair();

        pool.acquire(EndpointClass::Price, &mut rx).await.unwrap();
        pool.close();
        let result = pool.acquire(EndpointClass::Price, &mut rx).await;
        assert!(matches!(result, Err(RateLimitError::Closed)));
    }
}
