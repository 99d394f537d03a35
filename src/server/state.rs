use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::proxy::ProxyDispatcher;
use crate::routing::RouteRegistry;
use crate::upstream::{BreakerRegistry, HttpInvoker};
use std::sync::Arc;
use tracing::info;

/// Everything the proxy and admin listeners share. Cheap to clone.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub metrics: Metrics,
    pub routes: RouteRegistry,
    pub breakers: Arc<BreakerRegistry>,
    pub dispatcher: Arc<ProxyDispatcher<HttpInvoker>>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig, metrics: Metrics) -> Self {
        let routes = RouteRegistry::from_config(&config);
        let breakers = Arc::new(BreakerRegistry::from_config(&config));
        let invoker = HttpInvoker::new(config.limits.max_body_bytes);
        let dispatcher = Arc::new(ProxyDispatcher::new(
            routes.clone(),
            breakers.clone(),
            invoker,
        ));

        info!(
            "server: state initialized, services={}, max_body_bytes={}",
            routes.len(),
            config.limits.max_body_bytes
        );

        Self {
            config: Arc::new(config),
            metrics,
            routes,
            breakers,
            dispatcher,
        }
    }

    pub fn max_body_bytes(&self) -> u64 {
        self.config.limits.max_body_bytes
    }
}
