//! Sliding-window rate limiting.
//!
//! A [`Quota`] is a key plus a `limit/window` rate. `hit` records one request
//! against several quotas at once and only if none of them is full, so a
//! rejected request never consumes budget from the quotas that still had room.

pub mod limiter;
pub mod middleware;
pub mod redis_store;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub use limiter::{IpVerdict, Plan, RateLimitConfig, RateLimiter, Scope, ScopeStatus};
pub use redis_store::RedisRateLimitStore;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Invalid rate '{0}': expected '<count>/<second|minute|hour|day>'")]
    InvalidRate(String),

    #[error("Unexpected reply from rate limit store: {0}")]
    UnexpectedReply(String),
}

/// `limit` requests per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: u64,
    pub window: Duration,
}

impl RateLimit {
    pub const fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    pub const fn per_minute(limit: u64) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    pub const fn per_hour(limit: u64) -> Self {
        Self::new(limit, Duration::from_secs(3600))
    }

    pub const fn per_day(limit: u64) -> Self {
        Self::new(limit, Duration::from_secs(86_400))
    }
}

impl FromStr for RateLimit {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RateLimitError::InvalidRate(s.to_string());
        let (count, unit) = s.split_once('/').ok_or_else(invalid)?;
        let limit = count.trim().parse::<u64>().map_err(|_| invalid())?;
        let secs = match unit.trim() {
            "s" | "sec" | "second" => 1,
            "m" | "min" | "minute" => 60,
            "h" | "hour" => 3600,
            "d" | "day" => 86_400,
            _ => return Err(invalid()),
        };
        Ok(Self::new(limit, Duration::from_secs(secs)))
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.window.as_secs() {
            1 => "second",
            60 => "minute",
            3600 => "hour",
            86_400 => "day",
            secs => return write!(f, "{}/{secs}s", self.limit),
        };
        write!(f, "{}/{unit}", self.limit)
    }
}

/// One rate applied to one key, e.g. `ip:10.0.0.1:minute` at 60/minute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quota {
    pub key: String,
    pub rate: RateLimit,
}

impl Quota {
    pub fn new(key: impl Into<String>, rate: RateLimit) -> Self {
        Self {
            key: key.into(),
            rate,
        }
    }
}

/// State of one quota's window after a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUsage {
    pub limit: u64,
    pub used: u64,
    /// Time until the oldest counted request leaves the window.
    pub reset_after: Duration,
}

impl WindowUsage {
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    pub fn is_full(&self) -> bool {
        self.used >= self.limit
    }
}

/// Outcome of a `hit`. `windows` is in the order the quotas were given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub windows: Vec<WindowUsage>,
}

impl Decision {
    /// How long until every full window has room again.
    pub fn retry_after(&self) -> Duration {
        self.windows
            .iter()
            .filter(|w| w.is_full())
            .map(|w| w.reset_after)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Counts one request against every quota, unless one of them is already full.
    async fn hit(&self, quotas: &[Quota]) -> Result<Decision, RateLimitError>;

    /// Current usage without recording anything.
    async fn peek(&self, quotas: &[Quota]) -> Result<Decision, RateLimitError>;

    async fn block(&self, key: &str, duration: Duration) -> Result<(), RateLimitError>;

    /// Remaining block time, if `key` is blocked.
    async fn blocked_for(&self, key: &str) -> Result<Option<Duration>, RateLimitError>;
}

#[derive(Default)]
struct MemoryWindows {
    hits: HashMap<String, VecDeque<Instant>>,
    blocked: HashMap<String, Instant>,
}

impl MemoryWindows {
    fn evaluate(&mut self, quotas: &[Quota], record: bool) -> Decision {
        let now = Instant::now();
        let mut counts = Vec::with_capacity(quotas.len());
        for quota in quotas {
            let log = self.hits.entry(quota.key.clone()).or_default();
            while log
                .front()
                .is_some_and(|t| now.duration_since(*t) >= quota.rate.window)
            {
                log.pop_front();
            }
            counts.push(log.len() as u64);
        }

        let allowed = quotas
            .iter()
            .zip(&counts)
            .all(|(q, used)| *used < q.rate.limit);

        let windows = quotas
            .iter()
            .zip(counts)
            .map(|(quota, used)| {
                let log = self.hits.entry(quota.key.clone()).or_default();
                let used = if allowed && record {
                    log.push_back(now);
                    used + 1
                } else {
                    used
                };
                let reset_after = log
                    .front()
                    .map(|oldest| (*oldest + quota.rate.window).saturating_duration_since(now))
                    .unwrap_or(quota.rate.window);
                WindowUsage {
                    limit: quota.rate.limit,
                    used,
                    reset_after,
                }
            })
            .collect();

        Decision { allowed, windows }
    }
}

/// Process-local store. Used by tests and single-process development setups.
#[derive(Default)]
pub struct InMemoryRateLimitStore {
    state: Mutex<MemoryWindows>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn hit(&self, quotas: &[Quota]) -> Result<Decision, RateLimitError> {
        Ok(self.state.lock().await.evaluate(quotas, true))
    }

    async fn peek(&self, quotas: &[Quota]) -> Result<Decision, RateLimitError> {
        Ok(self.state.lock().await.evaluate(quotas, false))
    }

    async fn block(&self, key: &str, duration: Duration) -> Result<(), RateLimitError> {
        self.state
            .lock()
            .await
            .blocked
            .insert(key.to_string(), Instant::now() + duration);
        Ok(())
    }

    async fn blocked_for(&self, key: &str) -> Result<Option<Duration>, RateLimitError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match state.blocked.get(key).copied() {
            Some(until) if until > now => Ok(Some(until - now)),
            Some(_) => {
                state.blocked.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rates() {
        assert_eq!("3/day".parse::<RateLimit>().unwrap(), RateLimit::per_day(3));
        assert_eq!("100/hour".parse::<RateLimit>().unwrap(), RateLimit::per_hour(100));
        assert_eq!("60/minute".parse::<RateLimit>().unwrap(), RateLimit::per_minute(60));
        assert!("ten/day".parse::<RateLimit>().is_err());
        assert!("10/fortnight".parse::<RateLimit>().is_err());
        assert!("10".parse::<RateLimit>().is_err());
    }

    #[test]
    fn test_display_rates() {
        assert_eq!(RateLimit::per_day(5).to_string(), "5/day");
        assert_eq!(RateLimit::new(7, Duration::from_secs(90)).to_string(), "7/90s");
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_fills_and_slides() {
        let store = InMemoryRateLimitStore::new();
        let quota = [Quota::new("ip:1.2.3.4:minute", RateLimit::per_minute(2))];

        assert!(store.hit(&quota).await.unwrap().allowed);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(store.hit(&quota).await.unwrap().allowed);

        let rejected = store.hit(&quota).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.windows[0].used, 2);
        assert_eq!(rejected.retry_after(), Duration::from_secs(30));

        // The first request leaves the window; one slot frees up.
        tokio::time::advance(Duration::from_secs(30)).await;
        let allowed = store.hit(&quota).await.unwrap();
        assert!(allowed.allowed);
        assert_eq!(allowed.windows[0].remaining(), 0);
    }

    #[tokio::test]
    async fn test_rejected_hit_consumes_nothing() {
        let store = InMemoryRateLimitStore::new();
        let daily = Quota::new("user:u:questionnaires", RateLimit::per_day(5));
        let full = Quota::new("user:u:ai_responses", RateLimit::per_day(1));

        assert!(store.hit(&[daily.clone(), full.clone()]).await.unwrap().allowed);
        let rejected = store.hit(&[daily.clone(), full.clone()]).await.unwrap();
        assert!(!rejected.allowed);

        let usage = store.peek(&[daily]).await.unwrap();
        assert_eq!(usage.windows[0].used, 1);
    }

    #[tokio::test]
    async fn test_peek_does_not_record() {
        let store = InMemoryRateLimitStore::new();
        let quota = [Quota::new("k", RateLimit::per_hour(3))];
        store.peek(&quota).await.unwrap();
        let usage = store.peek(&quota).await.unwrap();
        assert!(usage.allowed);
        assert_eq!(usage.windows[0].used, 0);
        assert_eq!(usage.windows[0].reset_after, Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_expires() {
        let store = InMemoryRateLimitStore::new();
        store.block("blocked:ip:9.9.9.9", Duration::from_secs(900)).await.unwrap();
        assert_eq!(
            store.blocked_for("blocked:ip:9.9.9.9").await.unwrap(),
            Some(Duration::from_secs(900))
        );
        tokio::time::advance(Duration::from_secs(901)).await;
        assert_eq!(store.blocked_for("blocked:ip:9.9.9.9").await.unwrap(), None);
    }
}
