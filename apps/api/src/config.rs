use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::jobs::retry::RetryPolicy;
use crate::pagination::PaginationConfig;
use crate::ratelimit::RateLimitConfig;

/// Configuration shared by the api, worker and scheduler processes.
/// Loaded from environment variables; fails at startup if required ones are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Queue backend address. Every process must point at the same one.
    pub redis_url: String,
    pub port: u16,
    pub rust_log: String,
    pub run_migrations: bool,
    /// Prefix for `next`/`previous` locators. Relative locators when unset.
    pub public_base_url: Option<String>,
    pub page_size: u64,
    pub max_page_size: u64,
    pub worker_name: String,
    pub worker_concurrency: usize,
    pub task_max_retries: u32,
    pub task_retry_base_secs: u64,
    pub task_retry_max_secs: u64,
    pub scheduler_tick_secs: u64,
    pub cleanup_interval_secs: u64,
    pub retention_days: u32,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    /// Oldest dead letters beyond this many are dropped.
    pub dead_letter_max_len: u64,
    pub rate_limit_enabled: bool,
    pub rate_limit_per_minute: u64,
    pub rate_limit_per_hour: u64,
    pub rate_limit_suspicious_per_minute: u64,
    pub rate_limit_block_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            redis_url: require_env("REDIS_URL")?,
            port: env_or("PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            run_migrations: env_or("RUN_MIGRATIONS", false)?,
            public_base_url: optional_env("PUBLIC_BASE_URL"),
            page_size: env_or("PAGE_SIZE", 10)?,
            max_page_size: env_or("MAX_PAGE_SIZE", 100)?,
            worker_name: std::env::var("WORKER_NAME").unwrap_or_else(|_| "default".to_string()),
            worker_concurrency: env_or("WORKER_CONCURRENCY", 4)?,
            task_max_retries: env_or("TASK_MAX_RETRIES", 3)?,
            task_retry_base_secs: env_or("TASK_RETRY_BASE_SECS", 5)?,
            task_retry_max_secs: env_or("TASK_RETRY_MAX_SECS", 300)?,
            scheduler_tick_secs: env_or("SCHEDULER_TICK_SECS", 10)?,
            cleanup_interval_secs: env_or("CLEANUP_INTERVAL_SECS", 86_400)?,
            retention_days: env_or("RETENTION_DAYS", 90)?,
            openai_api_key: optional_env("OPENAI_API_KEY"),
            openai_model: std::env::var("OPENAI_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            dead_letter_max_len: env_or("DEAD_LETTER_MAX_LEN", 10_000)?,
            rate_limit_enabled: env_or("RATE_LIMIT_ENABLED", true)?,
            rate_limit_per_minute: env_or("RATE_LIMIT_PER_MINUTE", 60)?,
            rate_limit_per_hour: env_or("RATE_LIMIT_PER_HOUR", 1000)?,
            rate_limit_suspicious_per_minute: env_or("RATE_LIMIT_SUSPICIOUS_PER_MINUTE", 100)?,
            rate_limit_block_secs: env_or("RATE_LIMIT_BLOCK_SECS", 900)?,
        })
    }

    pub fn pagination(&self) -> PaginationConfig {
        PaginationConfig {
            default_page_size: self.page_size.max(1),
            max_page_size: self.max_page_size.max(1),
            public_base_url: self.public_base_url.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.task_max_retries,
            base_delay: Duration::from_secs(self.task_retry_base_secs),
            max_delay: Duration::from_secs(self.task_retry_max_secs),
        }
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            enabled: self.rate_limit_enabled,
            per_minute: self.rate_limit_per_minute,
            per_hour: self.rate_limit_per_hour,
            suspicious_per_minute: self.rate_limit_suspicious_per_minute,
            block_duration: Duration::from_secs(self.rate_limit_block_secs),
        }
    }

    /// Only the worker talks to the LLM provider, so the key is checked there.
    pub fn require_openai_key(&self) -> Result<&str> {
        self.openai_api_key
            .as_deref()
            .context("Required environment variable 'OPENAI_API_KEY' is not set")
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional_env(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Environment variable '{key}' has an invalid value '{raw}'")),
        None => Ok(default),
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        // Nothing listens on port 1, so database checks fail fast.
        database_url: "postgres://127.0.0.1:1/cvimprover_test".to_string(),
        redis_url: "redis://127.0.0.1:6379".to_string(),
        port: 8080,
        rust_log: "info".to_string(),
        run_migrations: false,
        public_base_url: None,
        page_size: 10,
        max_page_size: 100,
        worker_name: "test".to_string(),
        worker_concurrency: 2,
        task_max_retries: 3,
        task_retry_base_secs: 5,
        task_retry_max_secs: 300,
        scheduler_tick_secs: 10,
        cleanup_interval_secs: 86_400,
        retention_days: 90,
        openai_api_key: None,
        openai_model: "gpt-4o-mini".to_string(),
        dead_letter_max_len: 10_000,
        rate_limit_enabled: true,
        rate_limit_per_minute: 60,
        rate_limit_per_hour: 1000,
        rate_limit_suspicious_per_minute: 100,
        rate_limit_block_secs: 900,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_config_never_zero() {
        let mut config = test_config();
        config.page_size = 0;
        config.max_page_size = 0;
        let pagination = config.pagination();
        assert_eq!(pagination.default_page_size, 1);
        assert_eq!(pagination.max_page_size, 1);
    }

    #[test]
    fn test_retry_policy_from_config() {
        let policy = test_config().retry_policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(5));
        assert_eq!(policy.max_delay, Duration::from_secs(300));
    }

    #[test]
    fn test_rate_limit_defaults() {
        assert_eq!(test_config().rate_limit(), RateLimitConfig::default());
    }

    #[test]
    fn test_missing_openai_key_is_reported() {
        let err = test_config().require_openai_key().unwrap_err();
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }
}
