use std::time::Duration;

use crate::errors::GraphError;
use crate::retry::RetryPolicy;

pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Engine settings, chosen once at startup and injected into every service.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Suffix of group ids: `{name}@{partition}.{domain}`.
    pub domain: String,
    pub max_depth: usize,
    pub retry: RetryPolicy,
    pub cache_ttl: Duration,
    /// Upper bound for each compensating call during rollback.
    pub rollback_step_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            domain: "example.com".to_string(),
            max_depth: DEFAULT_MAX_DEPTH,
            retry: RetryPolicy::default(),
            cache_ttl: Duration::from_secs(300),
            rollback_step_timeout: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, GraphError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, GraphError> {
        let defaults = Self::default();

        let domain = lookup("MEMBERSHIP_DOMAIN").unwrap_or(defaults.domain);
        if domain.trim().is_empty() {
            return Err(GraphError::configuration("MEMBERSHIP_DOMAIN must not be empty"));
        }

        let max_depth = parse_or(&lookup, "GROUP_MAX_DEPTH", defaults.max_depth)?;
        if max_depth < 2 {
            return Err(GraphError::configuration("GROUP_MAX_DEPTH must be at least 2"));
        }

        let max_attempts = parse_or(&lookup, "STORE_RETRY_ATTEMPTS", defaults.retry.max_attempts)?;
        if max_attempts == 0 {
            return Err(GraphError::configuration("STORE_RETRY_ATTEMPTS must be at least 1"));
        }
        let base_delay_ms = parse_or(&lookup, "STORE_RETRY_BASE_MS", defaults.retry.base_delay.as_millis() as u64)?;
        let max_delay_ms = parse_or(&lookup, "STORE_RETRY_MAX_MS", defaults.retry.max_delay.as_millis() as u64)?;
        let cache_ttl_secs = parse_or(&lookup, "MEMBERSHIP_CACHE_TTL_SECS", defaults.cache_ttl.as_secs())?;
        let rollback_ms = parse_or(
            &lookup,
            "ROLLBACK_STEP_TIMEOUT_MS",
            defaults.rollback_step_timeout.as_millis() as u64,
        )?;

        Ok(Self {
            domain,
            max_depth,
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(base_delay_ms),
                max_delay: Duration::from_millis(max_delay_ms),
            },
            cache_ttl: Duration::from_secs(cache_ttl_secs),
            rollback_step_timeout: Duration::from_millis(rollback_ms),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, GraphError> {
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| GraphError::configuration(format!("{key} must be a valid non-negative integer"))),
        None => Ok(default),
    }
}
