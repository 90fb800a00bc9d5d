use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;
use uuid::Uuid;

use super::{Decision, Quota, RateLimitError, RateLimitStore, WindowUsage};

pub const DEFAULT_PREFIX: &str = "cvimprover:ratelimit";

/// Sliding window over one sorted set per quota, scored by request time in ms.
///
/// ARGV[1] is now, ARGV[2] the member to record (empty to only read), then a
/// `window_ms, limit` pair per key. Returns `allowed` followed by a
/// `count, reset_ms` pair per key.
const WINDOW_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local member = ARGV[2]
local counts = {}
local allowed = 1
for i, key in ipairs(KEYS) do
    local window = tonumber(ARGV[1 + 2 * i])
    local limit = tonumber(ARGV[2 + 2 * i])
    redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
    counts[i] = redis.call('ZCARD', key)
    if counts[i] >= limit then
        allowed = 0
    end
end
local reply = { allowed }
for i, key in ipairs(KEYS) do
    local window = tonumber(ARGV[1 + 2 * i])
    if allowed == 1 and member ~= '' then
        redis.call('ZADD', key, now, member)
        redis.call('PEXPIRE', key, window)
        counts[i] = counts[i] + 1
    end
    local reset = window
    local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
    if oldest[2] then
        reset = tonumber(oldest[2]) + window - now
    end
    table.insert(reply, counts[i])
    table.insert(reply, reset)
end
return reply
"#;

pub struct RedisRateLimitStore {
    conn: MultiplexedConnection,
    prefix: String,
    window: Script,
}

impl RedisRateLimitStore {
    pub async fn connect(client: &redis::Client, prefix: &str) -> Result<Self, RateLimitError> {
        Ok(Self {
            conn: client.get_multiplexed_async_connection().await?,
            prefix: prefix.to_string(),
            window: Script::new(WINDOW_SCRIPT),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }

    async fn evaluate(&self, quotas: &[Quota], record: bool) -> Result<Decision, RateLimitError> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let member = if record {
            format!("{now_ms}:{}", Uuid::new_v4())
        } else {
            String::new()
        };

        let mut invocation = self.window.prepare_invoke();
        invocation.arg(now_ms).arg(member);
        for quota in quotas {
            invocation
                .key(self.key(&quota.key))
                .arg(quota.rate.window.as_millis() as u64)
                .arg(quota.rate.limit);
        }

        let mut conn = self.conn.clone();
        let reply: Vec<i64> = invocation.invoke_async(&mut conn).await?;
        decode_reply(&reply, quotas)
    }
}

fn decode_reply(reply: &[i64], quotas: &[Quota]) -> Result<Decision, RateLimitError> {
    let (allowed, pairs) = reply
        .split_first()
        .ok_or_else(|| RateLimitError::UnexpectedReply("empty reply".to_string()))?;
    if pairs.len() != quotas.len() * 2 {
        return Err(RateLimitError::UnexpectedReply(format!(
            "expected {} values, got {}",
            quotas.len() * 2 + 1,
            reply.len()
        )));
    }
    let windows = quotas
        .iter()
        .zip(pairs.chunks_exact(2))
        .map(|(quota, pair)| WindowUsage {
            limit: quota.rate.limit,
            used: u64::try_from(pair[0]).unwrap_or(0),
            reset_after: Duration::from_millis(u64::try_from(pair[1]).unwrap_or(0)),
        })
        .collect();
    Ok(Decision {
        allowed: *allowed == 1,
        windows,
    })
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn hit(&self, quotas: &[Quota]) -> Result<Decision, RateLimitError> {
        self.evaluate(quotas, true).await
    }

    async fn peek(&self, quotas: &[Quota]) -> Result<Decision, RateLimitError> {
        self.evaluate(quotas, false).await
    }

    async fn block(&self, key: &str, duration: Duration) -> Result<(), RateLimitError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(self.key(key))
            .arg(1)
            .arg("PX")
            .arg(duration.as_millis().max(1) as u64)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn blocked_for(&self, key: &str) -> Result<Option<Duration>, RateLimitError> {
        let mut conn = self.conn.clone();
        // PTTL is -2 for a missing key and -1 for one without expiry.
        let ttl: i64 = redis::cmd("PTTL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(match ttl {
            -2 => None,
            -1 => Some(Duration::ZERO),
            ms => Some(Duration::from_millis(ms.max(0) as u64)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimit;

    #[test]
    fn test_decode_reply() {
        let quotas = [
            Quota::new("a", RateLimit::per_minute(2)),
            Quota::new("b", RateLimit::per_hour(10)),
        ];
        let decision = decode_reply(&[0, 2, 15_000, 3, 3_000_000], &quotas).unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.windows[0].used, 2);
        assert_eq!(decision.retry_after(), Duration::from_secs(15));
        assert_eq!(decision.windows[1].remaining(), 7);

        assert!(decode_reply(&[], &quotas).is_err());
        assert!(decode_reply(&[1, 0], &quotas).is_err());
    }

    async fn store() -> RedisRateLimitStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let client = redis::Client::open(url).unwrap();
        RedisRateLimitStore::connect(&client, &format!("cvimprover:test:{}", Uuid::new_v4()))
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore = "needs a running Redis at REDIS_URL"]
    async fn test_redis_window_rejects_without_recording() {
        let store = store().await;
        let small = Quota::new("user:u:ai_responses", RateLimit::per_day(1));
        let large = Quota::new("user:u:questionnaires", RateLimit::per_day(5));
        let both = [small.clone(), large.clone()];

        let first = store.hit(&both).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.windows[1].used, 1);

        let second = store.hit(&both).await.unwrap();
        assert!(!second.allowed);
        assert!(second.retry_after() > Duration::from_secs(86_000));

        let usage = store.peek(&[large]).await.unwrap();
        assert_eq!(usage.windows[0].used, 1);
    }

    #[tokio::test]
    #[ignore = "needs a running Redis at REDIS_URL"]
    async fn test_redis_block() {
        let store = store().await;
        assert_eq!(store.blocked_for("blocked:ip:1.1.1.1").await.unwrap(), None);
        store
            .block("blocked:ip:1.1.1.1", Duration::from_secs(900))
            .await
            .unwrap();
        let left = store.blocked_for("blocked:ip:1.1.1.1").await.unwrap().unwrap();
        assert!(left > Duration::from_secs(890));
    }
}
