use crate::config::{CircuitBreakerConfig, GatewayConfig};
use crate::upstream::circuit_breaker::CircuitBreaker;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Process-wide map from service id to its circuit breaker.
///
/// Breakers are created on first reference and live until the process
/// exits; nothing is ever evicted. Concurrent first lookups of the same id
/// race on the shard lock and all get the same instance.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    defaults: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
}

impl BreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
            overrides: HashMap::new(),
        }
    }

    /// Defaults plus the merged per-service overrides from `config`.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let overrides = config
            .services
            .iter()
            .filter(|(_, svc)| svc.circuit_breaker.is_some())
            .map(|(id, _)| (id.clone(), config.breaker_config_for(id)))
            .collect();
        Self {
            breakers: DashMap::new(),
            defaults: config.circuit_breaker.clone(),
            overrides,
        }
    }

    /// Return the breaker for `service_id`, creating it if absent.
    pub fn get(&self, service_id: &str) -> Arc<CircuitBreaker> {
        // Fast path: key already exists, no allocation.
        if let Some(entry) = self.breakers.get(service_id) {
            return entry.value().clone();
        }
        self.breakers
            .entry(service_id.to_string())
            .or_insert_with(|| {
                tracing::debug!("circuit_breaker: created breaker for {}", service_id);
                Arc::new(CircuitBreaker::new(
                    service_id,
                    self.config_for(service_id).clone(),
                ))
            })
            .clone()
    }

    /// Existing breaker only; never creates one.
    pub fn peek(&self, service_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(service_id).map(|e| e.value().clone())
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.breakers.contains_key(service_id)
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// All created breakers sorted by service id.
    pub fn snapshot(&self) -> Vec<Arc<CircuitBreaker>> {
        let mut all: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    fn config_for(&self, service_id: &str) -> &CircuitBreakerConfig {
        self.overrides.get(service_id).unwrap_or(&self.defaults)
    }
}
