//! Process-wide registry of circuit breakers and bulkheads.
//!
//! One breaker per dependency name and one bulkhead per (name, tier), created on
//! first lookup. The registry is an explicit object: build it at startup and
//! hand it to whatever needs it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::bulkhead::{Bulkhead, BulkheadConfig, BulkheadStats, BulkheadTier};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics};
use crate::retry::{RetryBudget, RetryBudgetConfig, RetryExecutor, RetryPolicy};

type BulkheadKey = (String, BulkheadTier);

/// Shared lookup-or-create registry for resilience primitives.
#[derive(Debug, Default)]
pub struct ResilienceRegistry {
    breaker_defaults: CircuitBreakerConfig,
    breaker_overrides: RwLock<HashMap<String, CircuitBreakerConfig>>,
    bulkhead_overrides: RwLock<HashMap<BulkheadKey, BulkheadConfig>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    bulkheads: RwLock<HashMap<BulkheadKey, Arc<Bulkhead>>>,
    retry_budget: Option<Arc<RetryBudget>>,
}

/// Statistics for every registered primitive.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub circuit_breakers: Vec<CircuitBreakerMetrics>,
    pub bulkheads: Vec<BulkheadStats>,
}

impl ResilienceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Config used for breakers without a per-name override.
    pub fn with_breaker_defaults(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_defaults = config;
        self
    }

    /// Installs a global retry budget shared by every executor from [`Self::retry_executor`].
    pub fn with_retry_budget(mut self, config: RetryBudgetConfig) -> Self {
        self.retry_budget = Some(Arc::new(RetryBudget::new(config)));
        self
    }

    /// Sets the config for one breaker. An existing breaker of that name is replaced.
    pub fn configure_breaker(&self, name: impl Into<String>, config: CircuitBreakerConfig) {
        let name = name.into();
        self.breakers.write().remove(&name);
        self.breaker_overrides.write().insert(name, config);
    }

    /// Sets the config for one bulkhead. An existing bulkhead for that key is replaced.
    pub fn configure_bulkhead(
        &self,
        name: impl Into<String>,
        tier: BulkheadTier,
        config: BulkheadConfig,
    ) {
        let key = (name.into(), tier);
        self.bulkheads.write().remove(&key);
        self.bulkhead_overrides.write().insert(key, config);
    }

    /// Returns the breaker for `name`, creating it if needed.
    pub fn circuit_breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return breaker.clone();
        }
        let config = self
            .breaker_overrides
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.breaker_defaults.clone());
        self.breakers
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    /// Returns the bulkhead for `(name, tier)`, creating it if needed.
    pub fn bulkhead(&self, name: &str, tier: BulkheadTier) -> Arc<Bulkhead> {
        let key = (name.to_string(), tier);
        if let Some(bulkhead) = self.bulkheads.read().get(&key) {
            return bulkhead.clone();
        }
        let config = self
            .bulkhead_overrides
            .read()
            .get(&key)
            .copied()
            .unwrap_or_else(|| BulkheadConfig::for_tier(tier));
        self.bulkheads
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(Bulkhead::new(name, tier, config)))
            .clone()
    }

    /// Builds a retry executor wired to the global budget, if one is installed.
    pub fn retry_executor(&self, policy: RetryPolicy) -> RetryExecutor {
        let executor = RetryExecutor::new(policy);
        match &self.retry_budget {
            Some(budget) => executor.with_budget(budget.clone()),
            None => executor,
        }
    }

    pub fn retry_budget(&self) -> Option<&Arc<RetryBudget>> {
        self.retry_budget.as_ref()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut circuit_breakers: Vec<_> =
            self.breakers.read().values().map(|b| b.metrics()).collect();
        circuit_breakers.sort_by(|a, b| a.name.cmp(&b.name));

        let mut bulkheads: Vec<_> = self.bulkheads.read().values().map(|b| b.stats()).collect();
        bulkheads.sort_by(|a, b| a.name.cmp(&b.name).then(a.tier.as_str().cmp(b.tier.as_str())));

        RegistrySnapshot {
            circuit_breakers,
            bulkheads,
        }
    }

    /// Closes every breaker.
    pub fn reset_breakers(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }
}
