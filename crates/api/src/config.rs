//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use resilience::{CircuitBreakerConfig, ResilienceRegistry, RetryBudgetConfig, RetryPolicy};
use saga::OrchestratorConfig;
use saga::order_fulfillment::FulfillmentOptions;

/// Server and orchestration configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `DATABASE_URL`: PostgreSQL connection string; in-memory stores when unset
/// - `SAGA_TIMEOUT_SECS`: overall saga deadline (default: `300`)
/// - `STEP_TIMEOUT_SECS`: per-step timeout (default: `30`)
/// - `IDEMPOTENCY_TTL_SECS`: lifetime of cached step results (default: 7 days)
/// - `BREAKER_FAILURE_THRESHOLD`: failures that open a circuit (default: `5`)
/// - `BREAKER_RECOVERY_SECS`: time an open circuit waits before probing (default: `30`)
/// - `RETRY_MAX_ATTEMPTS`: attempts per step call, first one included (default: `3`)
/// - `RETRY_BUDGET_PER_SECOND`: global retry token refill rate (default: `10`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub saga_timeout: Duration,
    pub step_timeout: Duration,
    pub idempotency_ttl: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_recovery: Duration,
    pub retry_max_attempts: u32,
    pub retry_budget_per_second: f64,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: env_or("PORT", defaults.port),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: std::env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            saga_timeout: secs_or("SAGA_TIMEOUT_SECS", defaults.saga_timeout),
            step_timeout: secs_or("STEP_TIMEOUT_SECS", defaults.step_timeout),
            idempotency_ttl: secs_or("IDEMPOTENCY_TTL_SECS", defaults.idempotency_ttl),
            breaker_failure_threshold: env_or(
                "BREAKER_FAILURE_THRESHOLD",
                defaults.breaker_failure_threshold,
            ),
            breaker_recovery: secs_or("BREAKER_RECOVERY_SECS", defaults.breaker_recovery),
            retry_max_attempts: env_or("RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts),
            retry_budget_per_second: env_or(
                "RETRY_BUDGET_PER_SECOND",
                defaults.retry_budget_per_second,
            ),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn fulfillment_options(&self) -> FulfillmentOptions {
        FulfillmentOptions {
            saga_timeout: self.saga_timeout,
            step_timeout: self.step_timeout,
            retry_policy: RetryPolicy::default().with_max_attempts(self.retry_max_attempts),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            idempotency_ttl: self.idempotency_ttl,
            ..OrchestratorConfig::default()
        }
    }

    /// A registry with breaker defaults and the global retry budget applied.
    pub fn resilience_registry(&self) -> ResilienceRegistry {
        ResilienceRegistry::new()
            .with_breaker_defaults(CircuitBreakerConfig::new(
                self.breaker_failure_threshold,
                self.breaker_recovery,
            ))
            .with_retry_budget(RetryBudgetConfig {
                budget_per_second: self.retry_budget_per_second,
                ..RetryBudgetConfig::default()
            })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            saga_timeout: Duration::from_secs(5 * 60),
            step_timeout: Duration::from_secs(30),
            idempotency_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            breaker_failure_threshold: 5,
            breaker_recovery: Duration::from_secs(30),
            retry_max_attempts: 3,
            retry_budget_per_second: 10.0,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn secs_or(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
