//! Per-client admission control.
//!
//! Every client identity (its IP address) owns a token bucket holding at most
//! `capacity` tokens. A request takes one token; tokens flow back in
//! continuously so an empty bucket is full again after `refill_interval`.
//!
//! # Thread Safety
//!
//! All buckets live in one map behind a single `Mutex`. The refill, the
//! balance check and the decrement happen in the same critical section, so
//! two concurrent requests from one client can never both spend the last
//! token. Nothing under the lock does I/O.
//!
//! # Memory
//!
//! Buckets idle for longer than `idle_timeout` are dropped by [`RateLimiter::sweep`],
//! which [`RateLimiter::spawn_sweeper`] runs every `sweep_interval` until
//! cancelled. `max_tracked` caps the map: a new client arriving at the cap
//! forces a sweep and is refused if that frees nothing.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Time source for the limiter. Swappable so tests can move time by hand.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self { now: Mutex::new(Instant::now()) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Configuration for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Burst size: the most requests a client can make back to back.
    pub capacity: u32,

    /// Time for an empty bucket to refill completely.
    pub refill_interval: Duration,

    /// Buckets untouched for longer than this are swept.
    pub idle_timeout: Duration,

    /// Period of the background sweep.
    pub sweep_interval: Duration,

    /// Hard cap on distinct tracked clients.
    pub max_tracked: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            // 10 requests per minute per client
            capacity: 10,
            refill_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            max_tracked: 10_000,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("rate limit exceeded")]
pub struct RateLimited {
    /// How long until the client has one token again.
    pub retry_after: Duration,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, cfg: &RateLimitConfig) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let cap = f64::from(cfg.capacity);
        // multiply before dividing so whole intervals land on exact values
        let gained = elapsed * cap / cfg.refill_interval.as_secs_f64();
        self.tokens = (self.tokens + gained).min(cap);
        self.last_refill = now;
    }
}

enum Admission {
    Granted,
    Throttled { retry_after: Duration },
    CapReached { swept: usize, tracked: usize },
}

pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock, buckets: Mutex::new(HashMap::new()) }
    }

    pub fn with_system_clock(config: RateLimitConfig) -> Self {
        Self::new(config, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admit one request from `ip`, or say how long it has to wait.
    pub fn check(&self, ip: IpAddr) -> Result<(), RateLimited> {
        let now = self.clock.now();
        let outcome = {
            let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
            self.admit_locked(&mut buckets, ip, now)
        };
        // logging happens after the guard is gone
        match outcome {
            Admission::Granted => Ok(()),
            Admission::Throttled { retry_after } => {
                tracing::warn!(ip = %ip, capacity = self.config.capacity, "rate limit exceeded");
                Err(RateLimited { retry_after })
            }
            Admission::CapReached { swept, tracked } => {
                tracing::debug!(removed = swept, "tracked client cap reached, forced sweep");
                tracing::warn!(
                    ip = %ip,
                    tracked,
                    max_tracked = self.config.max_tracked,
                    "rejecting new client: tracked client cap reached"
                );
                Err(RateLimited { retry_after: self.token_period() })
            }
        }
    }

    fn admit_locked(
        &self,
        buckets: &mut HashMap<IpAddr, Bucket>,
        ip: IpAddr,
        now: Instant,
    ) -> Admission {
        if !buckets.contains_key(&ip) && buckets.len() >= self.config.max_tracked {
            let swept = self.sweep_locked(buckets, now);
            if buckets.len() >= self.config.max_tracked {
                return Admission::CapReached { swept, tracked: buckets.len() };
            }
        }

        let cap = f64::from(self.config.capacity);
        let bucket = buckets.entry(ip).or_insert(Bucket { tokens: cap, last_refill: now });
        bucket.refill(now, &self.config);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Admission::Granted;
        }

        let missing = 1.0 - bucket.tokens;
        let wait = missing * self.config.refill_interval.as_secs_f64() / cap;
        // a zero capacity never refills; fall back to a whole interval
        let retry_after =
            Duration::try_from_secs_f64(wait).unwrap_or(self.config.refill_interval);
        Admission::Throttled { retry_after }
    }

    /// Drop buckets idle beyond `idle_timeout`. Returns how many went.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        self.sweep_locked(&mut buckets, now)
    }

    fn sweep_locked(&self, buckets: &mut HashMap<IpAddr, Bucket>, now: Instant) -> usize {
        let before = buckets.len();
        let idle = self.config.idle_timeout;
        buckets.retain(|_, b| now.saturating_duration_since(b.last_refill) <= idle);
        before - buckets.len()
    }

    /// Number of clients currently holding a bucket.
    pub fn tracked(&self) -> usize {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn token_period(&self) -> Duration {
        self.config.refill_interval / self.config.capacity.max(1)
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until `cancel` fires.
    pub fn spawn_sweeper(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.config.sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let removed = self.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, tracked = self.tracked(), "swept idle rate-limit buckets");
                        }
                    }
                }
            }
            tracing::debug!("rate-limit sweeper stopped");
        })
    }
}
