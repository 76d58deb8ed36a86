// ===============================
// src/ratelimit.rs
// ===============================
//
// Pelindung koneksi broker:
// - TokenBucket : kapasitas C, refill R/detik, refill+decrement atomik di bawah satu lock
// - Backoff     : min(base * mult^attempts, max) + jitter, reset hanya saat sukses
// - BrokerGuard : satu token per percobaan, retry error transient dengan Backoff
//
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::{BackoffCfg, RateCfg};
use crate::error::BrokerError;
use crate::metrics::{BROKER_RETRIES, RATE_LIMIT_DENIED, RATE_LIMIT_WAITS};

// Float slack so a sleep of exactly `wait` is enough to cover the deficit.
const EPS: f64 = 1e-9;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Starts full.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec,
            state: Mutex::new(BucketState { tokens: capacity as f64, last_refill: Instant::now() }),
        }
    }

    pub fn from_cfg(cfg: &RateCfg) -> Self {
        Self::new(cfg.capacity, cfg.refill_per_sec)
    }

    fn refill(&self, st: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(st.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            st.tokens = (st.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            st.last_refill = now;
        }
    }

    /// Refill, then take `n` tokens if present. Returns the deficit otherwise.
    fn take(&self, n: f64) -> Result<(), f64> {
        let mut st = self.state.lock();
        self.refill(&mut st);
        if st.tokens + EPS >= n {
            st.tokens = (st.tokens - n).max(0.0);
            Ok(())
        } else {
            Err(n - st.tokens)
        }
    }

    pub fn available(&self) -> f64 {
        let mut st = self.state.lock();
        self.refill(&mut st);
        st.tokens
    }

    /// Non-blocking variant of [`consume`](Self::consume).
    pub fn try_consume(&self, n: u32) -> bool {
        self.take(n as f64).is_ok()
    }

    /// Take `n` tokens, sleeping at most once for the computed deficit.
    pub async fn consume(&self, n: u32) -> bool {
        let n = n as f64;
        if n > self.capacity {
            RATE_LIMIT_DENIED.inc();
            warn!(requested = n, capacity = self.capacity, "token request exceeds bucket capacity");
            return false;
        }

        let deficit = match self.take(n) {
            Ok(()) => return true,
            Err(d) => d,
        };

        // lock dilepas sebelum sleep
        let wait = Duration::from_secs_f64(deficit / self.refill_per_sec);
        RATE_LIMIT_WAITS.inc();
        debug!(wait_ms = wait.as_millis() as u64, "token bucket empty, waiting");
        sleep(wait).await;

        match self.take(n) {
            Ok(()) => true,
            Err(_) => {
                RATE_LIMIT_DENIED.inc();
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    multiplier: f64,
    max: Duration,
    jitter: f64,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, multiplier: f64, max: Duration, jitter: f64) -> Self {
        Self { base, multiplier, max, jitter: jitter.clamp(0.0, 1.0), attempts: 0 }
    }

    pub fn from_cfg(cfg: &BackoffCfg) -> Self {
        Self::new(cfg.base, cfg.multiplier, cfg.max, cfg.jitter)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Un-jittered delay for the current attempt count.
    pub fn base_delay(&self) -> Duration {
        let exp = self.attempts.min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exp);
        let max = self.max.as_secs_f64();
        if secs.is_finite() {
            Duration::from_secs_f64(secs.min(max))
        } else {
            self.max
        }
    }

    pub fn next_interval(&mut self) -> Duration {
        let delay = self.base_delay();
        let j = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.jitter)
        } else {
            0.0
        };
        self.attempts = self.attempts.saturating_add(1);
        delay + delay.mul_f64(j)
    }

    pub fn on_success(&mut self) {
        self.attempts = 0;
    }
}

/// Every outbound broker call goes through here.
#[derive(Debug)]
pub struct BrokerGuard {
    bucket: TokenBucket,
    backoff: BackoffCfg,
}

impl BrokerGuard {
    pub fn new(bucket: TokenBucket, backoff: BackoffCfg) -> Self {
        Self { bucket, backoff }
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    /// Run `op` with one token per attempt. Transient failures (an empty
    /// bucket counts as one) are retried until `max_attempts` is reached.
    pub async fn call<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, BrokerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let mut backoff = Backoff::from_cfg(&self.backoff);
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let res = if self.bucket.consume(1).await {
                op().await
            } else {
                Err(BrokerError::RateLimited)
            };
            match res {
                Ok(v) => {
                    backoff.on_success();
                    return Ok(v);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let wait = backoff.next_interval();
                    BROKER_RETRIES.inc();
                    warn!(call = %what, attempt, error = %e, wait_ms = wait.as_millis() as u64, "transient broker failure, retrying");
                    sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn partial_consume_does_not_block() {
        let bucket = TokenBucket::new(10, 10.0);
        let start = Instant::now();
        assert!(bucket.consume(5).await);
        assert!(start.elapsed() < Duration::from_millis(20));
        assert!(bucket.available() >= 4.9);
    }

    #[tokio::test]
    async fn empty_bucket_blocks_for_one_refill_interval() {
        let bucket = TokenBucket::new(10, 10.0);
        assert!(bucket.consume(10).await);
        let start = Instant::now();
        assert!(bucket.consume(1).await);
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn request_larger_than_capacity_fails_fast() {
        let bucket = TokenBucket::new(2, 1.0);
        let start = Instant::now();
        assert!(!bucket.consume(3).await);
        assert!(start.elapsed() < Duration::from_millis(20));
    }

    #[test]
    fn try_consume_never_waits() {
        let bucket = TokenBucket::new(2, 1.0);
        assert!(bucket.try_consume(2));
        assert!(!bucket.try_consume(1));
    }

    #[test]
    fn backoff_grows_then_caps() {
        let max = Duration::from_secs(4);
        let jitter = 0.2;
        let mut b = Backoff::new(Duration::from_millis(100), 2.0, max, jitter);
        let mut prev = Duration::ZERO;
        for _ in 0..40 {
            let base = b.base_delay();
            assert!(base >= prev);
            let next = b.next_interval();
            assert!(next >= base);
            assert!(next <= max.mul_f64(1.0 + jitter));
            prev = base;
        }
        assert_eq!(b.base_delay(), max);
        assert_eq!(b.attempts(), 40);
    }

    #[test]
    fn backoff_resets_only_on_success() {
        let mut b = Backoff::new(Duration::from_millis(100), 2.0, Duration::from_secs(10), 0.0);
        assert_eq!(b.next_interval(), Duration::from_millis(100));
        assert_eq!(b.next_interval(), Duration::from_millis(200));
        assert_eq!(b.next_interval(), Duration::from_millis(400));
        b.on_success();
        assert_eq!(b.attempts(), 0);
        assert_eq!(b.next_interval(), Duration::from_millis(100));
    }

    fn quick_backoff(max_attempts: u32) -> BackoffCfg {
        BackoffCfg {
            base: Duration::from_millis(1),
            multiplier: 2.0,
            max: Duration::from_millis(5),
            jitter: 0.0,
            max_attempts,
        }
    }

    #[tokio::test]
    async fn guard_retries_transient_errors() {
        let guard = BrokerGuard::new(TokenBucket::new(10, 100.0), quick_backoff(3));
        let calls = AtomicU32::new(0);
        let out = guard
            .call("test", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err(BrokerError::Timeout) } else { Ok(n) }
            })
            .await;
        assert_eq!(out.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn guard_does_not_retry_rejections() {
        let guard = BrokerGuard::new(TokenBucket::new(10, 100.0), quick_backoff(5));
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = guard
            .call("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::Rejected("margin".into()))
            })
            .await;
        assert!(matches!(out, Err(BrokerError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
