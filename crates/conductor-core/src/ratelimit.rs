//! Token-bucket rate limiting.
//!
//! Two users of the same machinery: per-endpoint limits parsed from
//! `"<count>/<period>"` strings, and the per-identity request limiter in
//! front of the API. Buckets refill continuously; a periodic sweep drops
//! buckets idle longer than a configured age.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use conductor_types::error::{CoreError, CoreResult};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Limit strings
// ---------------------------------------------------------------------------

/// A parsed `"<count>/<period>"` rate limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    /// Bucket capacity (burst).
    pub count: u32,
    /// Refill period.
    pub period: Duration,
}

impl RateLimit {
    /// Parse a limit string. Grammar (after case-folding and trimming):
    /// `<count>/<period>` with period one of second|sec|s, minute|min|m,
    /// hour|hr|h, day|d.
    pub fn parse(input: &str) -> CoreResult<Self> {
        let folded = input.trim().to_ascii_lowercase();
        let (count_str, period_str) = folded
            .split_once('/')
            .ok_or_else(|| CoreError::invalid_input(format!("invalid rate limit '{input}'")))?;
        let count: u32 = count_str
            .trim()
            .parse()
            .map_err(|_| CoreError::invalid_input(format!("invalid rate limit count '{input}'")))?;
        if count == 0 {
            return Err(CoreError::invalid_input("rate limit count must be > 0"));
        }
        let period = match period_str.trim() {
            "second" | "sec" | "s" => Duration::from_secs(1),
            "minute" | "min" | "m" => Duration::from_secs(60),
            "hour" | "hr" | "h" => Duration::from_secs(3600),
            "day" | "d" => Duration::from_secs(86400),
            other => {
                return Err(CoreError::invalid_input(format!(
                    "invalid rate limit period '{other}'"
                )));
            }
        };
        Ok(Self { count, period })
    }

    /// Tokens per second.
    pub fn rps(&self) -> f64 {
        f64::from(self.count) / self.period.as_secs_f64()
    }
}

// ---------------------------------------------------------------------------
// Buckets
// ---------------------------------------------------------------------------

/// Outcome of a bucket check, carrying everything the HTTP layer needs
/// for `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    /// Bucket capacity.
    pub limit: u32,
    /// Whole tokens remaining after this decision.
    pub remaining: u32,
    /// Time until the bucket is full again.
    pub reset_after: Duration,
    /// Time until one token is available (zero when allowed).
    pub retry_after: Duration,
}

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rps: f64,
    last_refill: Instant,
    last_used: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, rps: f64, now: Instant) -> Self {
        Self {
            capacity: f64::from(capacity),
            tokens: f64::from(capacity),
            rps,
            last_refill: now,
            last_used: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rps).min(self.capacity);
        self.last_refill = now;
    }

    fn try_acquire(&mut self, now: Instant) -> RateDecision {
        self.refill(now);
        self.last_used = now;

        let allowed = self.tokens >= 1.0;
        if allowed {
            self.tokens -= 1.0;
        }
        let reset_after = Duration::from_secs_f64((self.capacity - self.tokens) / self.rps);
        let retry_after = if allowed {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.rps)
        };
        RateDecision {
            allowed,
            limit: self.capacity as u32,
            remaining: self.tokens.floor() as u32,
            reset_after,
            retry_after,
        }
    }
}

/// Keyed token buckets behind a concurrent map; each bucket carries its
/// own lock.
pub struct RateLimiterMap {
    buckets: DashMap<String, Mutex<TokenBucket>>,
}

impl RateLimiterMap {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Check (and consume from) the bucket for `key`.
    pub fn check(&self, key: &str, capacity: u32, rps: f64) -> RateDecision {
        self.check_at(key, capacity, rps, Instant::now())
    }

    /// As `check`, with an injected clock.
    pub fn check_at(&self, key: &str, capacity: u32, rps: f64, now: Instant) -> RateDecision {
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(TokenBucket::new(capacity, rps, now)));
        let mut bucket = bucket.lock().expect("bucket lock");
        bucket.try_acquire(now)
    }

    /// Check against a parsed limit, keyed by `key`.
    pub fn check_limit(&self, key: &str, limit: &RateLimit) -> RateDecision {
        self.check(key, limit.count, limit.rps())
    }

    /// Drop buckets idle longer than `max_age`.
    pub fn sweep(&self, max_age: Duration) {
        let now = Instant::now();
        self.buckets.retain(|_, bucket| {
            let bucket = bucket.lock().expect("bucket lock");
            now.saturating_duration_since(bucket.last_used) < max_age
        });
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Spawn the periodic idle-bucket sweeper.
    pub fn spawn_sweeper(
        self: std::sync::Arc<Self>,
        interval: Duration,
        max_age: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => self.sweep(max_age),
                }
            }
        })
    }
}

impl Default for RateLimiterMap {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical_forms() {
        assert_eq!(
            RateLimit::parse("100/hour").unwrap(),
            RateLimit {
                count: 100,
                period: Duration::from_secs(3600)
            }
        );
        assert_eq!(RateLimit::parse("1/second").unwrap().count, 1);
        assert_eq!(
            RateLimit::parse("5/day").unwrap().period,
            Duration::from_secs(86400)
        );
    }

    #[test]
    fn test_parse_aliases_and_folding() {
        for input in ["10/m", "10/min", "10/MINUTE", " 10/minute "] {
            let limit = RateLimit::parse(input).unwrap();
            assert_eq!(limit.count, 10);
            assert_eq!(limit.period, Duration::from_secs(60));
        }
        assert_eq!(RateLimit::parse("2/s").unwrap().period, Duration::from_secs(1));
        assert_eq!(RateLimit::parse("2/hr").unwrap().period, Duration::from_secs(3600));
        assert_eq!(RateLimit::parse("2/d").unwrap().period, Duration::from_secs(86400));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for input in ["", "100", "/hour", "x/hour", "100/fortnight", "0/hour", "-1/hour"] {
            assert!(RateLimit::parse(input).is_err(), "accepted '{input}'");
        }
    }

    #[test]
    fn test_100_per_hour_rps() {
        let limit = RateLimit::parse("100/hour").unwrap();
        assert!((limit.rps() - 0.0277).abs() < 0.001);
    }

    #[test]
    fn test_bucket_admits_burst_then_denies() {
        let limiter = RateLimiterMap::new();
        let now = Instant::now();
        let limit = RateLimit::parse("2/minute").unwrap();

        let first = limiter.check_at("e", limit.count, limit.rps(), now);
        assert!(first.allowed);
        assert_eq!(first.limit, 2);
        assert_eq!(first.remaining, 1);

        let second = limiter.check_at("e", limit.count, limit.rps(), now);
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        let third = limiter.check_at("e", limit.count, limit.rps(), now);
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
        assert!(third.retry_after > Duration::ZERO);
        assert!(third.reset_after > Duration::ZERO);
    }

    #[test]
    fn test_bucket_refills_over_time() {
        let limiter = RateLimiterMap::new();
        let now = Instant::now();

        // 1/second, burst 1: admit, deny, admit again after one second.
        assert!(limiter.check_at("e", 1, 1.0, now).allowed);
        assert!(!limiter.check_at("e", 1, 1.0, now + Duration::from_millis(200)).allowed);
        assert!(limiter.check_at("e", 1, 1.0, now + Duration::from_millis(1100)).allowed);
    }

    #[test]
    fn test_full_burst_admits_instantly() {
        let limiter = RateLimiterMap::new();
        let now = Instant::now();
        let limit = RateLimit::parse("100/hour").unwrap();
        for i in 0..100 {
            assert!(
                limiter.check_at("e", limit.count, limit.rps(), now).allowed,
                "request {i} denied"
            );
        }
        assert!(!limiter.check_at("e", limit.count, limit.rps(), now).allowed);
    }

    #[test]
    fn test_consumption_bounded_by_window_rate_plus_burst() {
        let limiter = RateLimiterMap::new();
        let start = Instant::now();
        let limit = RateLimit::parse("10/second").unwrap();

        // Hammer for a simulated 2-second window at 1ms granularity.
        let mut admitted = 0u32;
        for ms in 0..2000 {
            let now = start + Duration::from_millis(ms);
            if limiter.check_at("e", limit.count, limit.rps(), now).allowed {
                admitted += 1;
            }
        }
        // tokens consumed <= W * rate + burst.
        assert!(admitted <= 2 * 10 + 10, "admitted {admitted}");
    }

    #[test]
    fn test_buckets_are_per_key() {
        let limiter = RateLimiterMap::new();
        let now = Instant::now();
        assert!(limiter.check_at("a", 1, 1.0, now).allowed);
        assert!(!limiter.check_at("a", 1, 1.0, now).allowed);
        assert!(limiter.check_at("b", 1, 1.0, now).allowed);
    }

    #[test]
    fn test_sweep_drops_idle_buckets() {
        let limiter = RateLimiterMap::new();
        limiter.check("a", 10, 1.0);
        assert_eq!(limiter.len(), 1);
        // Nothing is older than an hour.
        limiter.sweep(Duration::from_secs(3600));
        assert_eq!(limiter.len(), 1);
        // Everything is older than zero.
        limiter.sweep(Duration::ZERO);
        assert_eq!(limiter.len(), 0);
    }
}
