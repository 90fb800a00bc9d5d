use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::{Decision, Quota, RateLimit, RateLimitError, RateLimitStore, WindowUsage};

/// Usage at or above this percentage marks a scope as close to its limit.
const HIGH_USAGE_PERCENT: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Plan {
    Free,
    Basic,
    Pro,
    Premium,
}

impl Plan {
    pub fn rate(&self, scope: Scope) -> RateLimit {
        let (ai_responses, questionnaires, api_calls) = match self {
            Plan::Free => (3, 5, 100),
            Plan::Basic => (20, 50, 300),
            Plan::Pro => (100, 200, 600),
            Plan::Premium => (1000, 1000, 1200),
        };
        match scope {
            Scope::AiResponses => RateLimit::per_day(ai_responses),
            Scope::Questionnaires => RateLimit::per_day(questionnaires),
            Scope::ApiCalls => RateLimit::per_hour(api_calls),
        }
    }

    /// The plan to recommend when this one runs out. `None` for the top plan.
    pub fn next(&self) -> Option<Plan> {
        match self {
            Plan::Free => Some(Plan::Basic),
            Plan::Basic => Some(Plan::Pro),
            Plan::Pro => Some(Plan::Premium),
            Plan::Premium => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    AiResponses,
    Questionnaires,
    ApiCalls,
}

impl Scope {
    pub const ALL: [Scope; 3] = [Scope::AiResponses, Scope::Questionnaires, Scope::ApiCalls];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::AiResponses => "ai_responses",
            Scope::Questionnaires => "questionnaires",
            Scope::ApiCalls => "api_calls",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub per_minute: u64,
    pub per_hour: u64,
    /// Requests per minute, rejected ones included, after which an IP is blocked.
    pub suspicious_per_minute: u64,
    pub block_duration: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_minute: 60,
            per_hour: 1000,
            suspicious_per_minute: 100,
            block_duration: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVerdict {
    Allowed {
        limit: u64,
        remaining: u64,
        reset_after: Duration,
    },
    Limited {
        limit: u64,
        retry_after: Duration,
    },
    Blocked {
        retry_after: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeStatus {
    Healthy,
    Moderate,
    High,
    Exceeded,
}

impl ScopeStatus {
    fn from_percentage(percent: f64) -> Self {
        if percent >= 100.0 {
            ScopeStatus::Exceeded
        } else if percent >= HIGH_USAGE_PERCENT {
            ScopeStatus::High
        } else if percent >= 50.0 {
            ScopeStatus::Moderate
        } else {
            ScopeStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeUsage {
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub percentage_used: f64,
    pub status: ScopeStatus,
}

impl ScopeUsage {
    fn new(window: &WindowUsage, now: DateTime<Utc>) -> Self {
        let percentage_used = if window.limit == 0 {
            100.0
        } else {
            let raw = window.used as f64 / window.limit as f64 * 100.0;
            (raw * 100.0).round() / 100.0
        };
        let reset_after = chrono::Duration::from_std(window.reset_after)
            .unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            limit: window.limit,
            used: window.used,
            remaining: window.remaining(),
            reset_at: now + reset_after,
            percentage_used,
            status: ScopeStatus::from_percentage(percentage_used),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpgradeRecommendation {
    pub should_upgrade: bool,
    pub recommended_plan: Option<Plan>,
    pub high_usage_scopes: Vec<Scope>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub plan: Plan,
    pub rate_limits: BTreeMap<Scope, ScopeUsage>,
    pub upgrade_recommendation: UpgradeRecommendation,
}

/// Per-IP and per-user limits on top of a [`RateLimitStore`].
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Counts one request from `ip` against the per-minute and per-hour limits.
    ///
    /// Every attempt, rejected or not, also counts toward the suspicious
    /// threshold; crossing it blocks the IP for `block_duration`.
    pub async fn check_ip(&self, ip: &str) -> Result<IpVerdict, RateLimitError> {
        let block_key = format!("blocked:ip:{ip}");
        if let Some(retry_after) = self.store.blocked_for(&block_key).await? {
            return Ok(IpVerdict::Blocked { retry_after });
        }

        let attempts = Quota::new(
            format!("ip:{ip}:attempts"),
            RateLimit::per_minute(self.config.suspicious_per_minute),
        );
        if !self.store.hit(&[attempts]).await?.allowed {
            warn!(
                ip,
                threshold = self.config.suspicious_per_minute,
                block_secs = self.config.block_duration.as_secs(),
                "Blocking IP after suspicious request rate"
            );
            self.store.block(&block_key, self.config.block_duration).await?;
            return Ok(IpVerdict::Blocked {
                retry_after: self.config.block_duration,
            });
        }

        let quotas = [
            Quota::new(format!("ip:{ip}:minute"), RateLimit::per_minute(self.config.per_minute)),
            Quota::new(format!("ip:{ip}:hour"), RateLimit::per_hour(self.config.per_hour)),
        ];
        let decision = self.store.hit(&quotas).await?;
        let minute = decision.windows[0];
        if decision.allowed {
            Ok(IpVerdict::Allowed {
                limit: minute.limit,
                remaining: minute.remaining(),
                reset_after: minute.reset_after,
            })
        } else {
            Ok(IpVerdict::Limited {
                limit: minute.limit,
                retry_after: decision.retry_after(),
            })
        }
    }

    fn user_quotas(user_id: Uuid, plan: Plan, scopes: &[Scope]) -> Vec<Quota> {
        scopes
            .iter()
            .map(|scope| Quota::new(format!("user:{user_id}:{scope}"), plan.rate(*scope)))
            .collect()
    }

    /// Counts one use of every scope for `user_id`, only if all of them have room.
    pub async fn check_scopes(
        &self,
        user_id: Uuid,
        plan: Plan,
        scopes: &[Scope],
    ) -> Result<Decision, RateLimitError> {
        self.store
            .hit(&Self::user_quotas(user_id, plan, scopes))
            .await
    }

    pub async fn status(&self, user_id: Uuid, plan: Plan) -> Result<RateLimitStatus, RateLimitError> {
        let decision = self
            .store
            .peek(&Self::user_quotas(user_id, plan, &Scope::ALL))
            .await?;
        let now = Utc::now();
        let rate_limits: BTreeMap<Scope, ScopeUsage> = Scope::ALL
            .into_iter()
            .zip(&decision.windows)
            .map(|(scope, window)| (scope, ScopeUsage::new(window, now)))
            .collect();

        let high_usage_scopes: Vec<Scope> = rate_limits
            .iter()
            .filter(|(_, usage)| usage.percentage_used >= HIGH_USAGE_PERCENT)
            .map(|(scope, _)| *scope)
            .collect();
        let recommended_plan = plan.next();
        let upgrade_recommendation = UpgradeRecommendation {
            should_upgrade: recommended_plan.is_some() && !high_usage_scopes.is_empty(),
            recommended_plan,
            high_usage_scopes,
        };

        Ok(RateLimitStatus {
            plan,
            rate_limits,
            upgrade_recommendation,
        })
    }
}
