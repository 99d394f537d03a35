use crate::config::GatewayConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Physical location of a logical service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRoute {
    pub service_id: String,
    /// Base URL without a trailing slash, e.g. `http://users:8081`.
    pub base_url: String,
    pub timeout: Duration,
}

impl ServiceRoute {
    pub fn new(service_id: impl Into<String>, base_url: &str, timeout: Duration) -> Self {
        Self {
            service_id: service_id.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

/// Read-only map from service id to route, built once at startup.
///
/// The gateway never mutates this after construction; tests build their own
/// registries with [`RouteRegistry::from_routes`].
#[derive(Debug, Clone, Default)]
pub struct RouteRegistry {
    routes: Arc<HashMap<String, ServiceRoute>>,
}

impl RouteRegistry {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::from_routes(config.services.iter().map(|(id, svc)| {
            ServiceRoute::new(
                id.clone(),
                &svc.url,
                Duration::from_millis(svc.timeout_millis()),
            )
        }))
    }

    pub fn from_routes(routes: impl IntoIterator<Item = ServiceRoute>) -> Self {
        let routes = routes
            .into_iter()
            .map(|r| (r.service_id.clone(), r))
            .collect();
        Self {
            routes: Arc::new(routes),
        }
    }

    pub fn resolve(&self, service_id: &str) -> Option<&ServiceRoute> {
        self.routes.get(service_id)
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.routes.contains_key(service_id)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Routes sorted by service id, for stable admin output.
    pub fn all_routes(&self) -> Vec<&ServiceRoute> {
        let mut routes: Vec<&ServiceRoute> = self.routes.values().collect();
        routes.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        routes
    }
}
