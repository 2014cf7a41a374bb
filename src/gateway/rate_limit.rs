//! Process-wide limiter for outbound API calls.
//!
//! The bucket is tracked GCRA-style: instead of a token count we keep the
//! theoretical arrival time (`tat`) of the next call. A call is allowed once
//! `tat - tolerance <= now`, where the tolerance lets `burst` calls through
//! back to back. This is the same contract as a token bucket of size `burst`
//! refilled at a steady rate, but needs only integer time arithmetic.
//!
//! The refill rate is derived so that no window of length `interval` ever
//! sees more than `calls_per_interval` calls, burst included.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Monotonic time source. Production uses [`TokioClock`]; tests inject
/// [`FakeClock`] so waits complete without real sleeping.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's origin.
    fn now(&self) -> Duration;

    async fn sleep_until(&self, deadline: Duration);

    async fn sleep(&self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep_until(&self, deadline: Duration) {
        tokio::time::sleep_until(self.origin + deadline).await;
    }
}

/// Virtual clock: sleeping jumps time forward to the deadline immediately.
#[derive(Debug, Default)]
pub struct FakeClock {
    now: Mutex<Duration>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn sleep_until(&self, deadline: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        if deadline > *now {
            *now = deadline;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub calls_per_interval: u32,
    pub interval: Duration,
    pub burst: u32,
}

impl RateLimit {
    fn burst(&self) -> u32 {
        self.burst.clamp(1, self.calls_per_interval.max(1))
    }

    /// Spacing between calls once the burst is spent. Rounded up so the
    /// per-interval cap holds exactly.
    pub fn emission_interval(&self) -> Duration {
        let slots = u128::from(self.calls_per_interval.max(1) - self.burst() + 1);
        let nanos = self.interval.as_nanos().div_ceil(slots);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    fn tolerance(&self) -> Duration {
        self.emission_interval() * (self.burst() - 1)
    }
}

pub struct RateLimiter {
    limit: RateLimit,
    clock: Arc<dyn Clock>,
    tat: Mutex<Duration>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(limit: RateLimit, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit,
            clock,
            tat: Mutex::new(Duration::ZERO),
        }
    }

    pub fn shared(limit: RateLimit, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self::new(limit, clock))
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Reserve the next slot and return the time at which it may be used.
    /// Reservations are handed out in call order, so waiters never overtake.
    fn reserve(&self) -> Duration {
        let now = self.clock.now();
        let mut tat = self.tat.lock().unwrap_or_else(|e| e.into_inner());
        let start = (*tat).max(now);
        *tat = start + self.limit.emission_interval();
        start.saturating_sub(self.limit.tolerance())
    }

    /// Wait until a call may be issued.
    pub async fn acquire(&self) {
        let at = self.reserve();
        if at > self.clock.now() {
            self.clock.sleep_until(at).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_in_window(stamps: &[Duration], window: Duration) -> usize {
        stamps
            .iter()
            .map(|start| {
                stamps
                    .iter()
                    .filter(|t| **t >= *start && **t < *start + window)
                    .count()
            })
            .max()
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn burst_passes_then_calls_are_spaced() {
        let clock = Arc::new(FakeClock::new());
        let limit = RateLimit {
            calls_per_interval: 5,
            interval: Duration::from_secs(1),
            burst: 2,
        };
        let limiter = RateLimiter::new(limit, clock.clone());

        let mut stamps = Vec::new();
        for _ in 0..20 {
            limiter.acquire().await;
            stamps.push(clock.now());
        }
        assert_eq!(stamps[0], Duration::ZERO);
        assert_eq!(stamps[1], Duration::ZERO);
        assert_eq!(stamps[2], Duration::from_millis(250));
        assert!(max_in_window(&stamps, Duration::from_secs(1)) <= 5);
    }

    #[tokio::test]
    async fn burst_of_one_spaces_every_call() {
        let clock = Arc::new(FakeClock::new());
        let limit = RateLimit {
            calls_per_interval: 3,
            interval: Duration::from_millis(300),
            burst: 1,
        };
        let limiter = RateLimiter::new(limit, clock.clone());
        let mut stamps = Vec::new();
        for _ in 0..6 {
            limiter.acquire().await;
            stamps.push(clock.now());
        }
        let gaps: Vec<_> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.iter().all(|g| *g == Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn idle_time_refills_the_bucket() {
        let clock = Arc::new(FakeClock::new());
        let limit = RateLimit {
            calls_per_interval: 4,
            interval: Duration::from_secs(4),
            burst: 2,
        };
        let limiter = RateLimiter::new(limit, clock.clone());
        limiter.acquire().await;
        limiter.acquire().await;
        clock.advance(Duration::from_secs(10));
        let before = clock.now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(clock.now(), before);
    }

    #[test]
    fn emission_interval_rounds_up() {
        let limit = RateLimit {
            calls_per_interval: 3,
            interval: Duration::from_nanos(10),
            burst: 1,
        };
        assert_eq!(limit.emission_interval(), Duration::from_nanos(4));
    }
}
