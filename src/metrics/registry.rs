use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the Prometheus recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric descriptions.
    ///
    /// Must be called **once** at startup; a second install fails.
    pub fn install() -> Result<Self> {
        let handle = builder()?
            .install_recorder()
            .context("failed to install metrics recorder")?;
        describe_all();
        Ok(Self { handle })
    }

    /// A recorder that is not installed globally. Renders nothing emitted via
    /// the macros; used where a process-wide recorder already exists or is
    /// unwanted, such as tests running several gateways in one process.
    pub fn detached() -> Result<Self> {
        let recorder = builder()?.build_recorder();
        Ok(Self {
            handle: recorder.handle(),
        })
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn builder() -> Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )
        .context("invalid histogram buckets")
}

fn describe_all() {
    // request path
    describe_counter!(
        "gateway_http_requests_total",
        Unit::Count,
        "Total proxied HTTP requests by service, method, status and outcome"
    );
    describe_histogram!(
        "gateway_http_request_duration_seconds",
        Unit::Seconds,
        "Total request duration from client perspective"
    );
    describe_histogram!(
        "gateway_upstream_request_duration_seconds",
        Unit::Seconds,
        "Backend call duration as measured by the breaker"
    );
    describe_counter!(
        "gateway_unknown_service_total",
        Unit::Count,
        "Requests naming a service that is not configured"
    );

    // circuit breaker
    describe_counter!(
        "gateway_circuit_breaker_rejected_total",
        Unit::Count,
        "Requests answered with the fallback because the breaker refused them"
    );
    describe_counter!(
        "gateway_circuit_breaker_transitions_total",
        Unit::Count,
        "Circuit breaker state transitions"
    );
    describe_gauge!(
        "gateway_circuit_breaker_state",
        Unit::Count,
        "Breaker state: 0=closed 1=open 2=half_open 3=forced_open 4=disabled"
    );

    // connections
    describe_gauge!(
        "gateway_connections_active",
        Unit::Count,
        "Number of active downstream connections"
    );
    describe_counter!(
        "gateway_connections_total",
        Unit::Count,
        "Total connections accepted"
    );
}
