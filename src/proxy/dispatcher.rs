use crate::error::GatewayError;
use crate::proxy::context::{full_body, json_response, BoxBody};
use crate::routing::{forwarded_path, target_url, RouteRegistry};
use crate::upstream::invoker::{method_has_body, sanitize_request_headers};
use crate::upstream::{
    BackendInvoker, BackendRequest, BackendResponse, BreakerRegistry, CallPermission,
    CircuitState, InvokeError,
};
use bytes::Bytes;
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, Method, StatusCode};
use hyper::Response;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// An inbound proxy request after the body has been buffered.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    /// Full inbound path, `/proxy/{serviceId}/...`.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// What happened to one proxied request.
#[derive(Debug)]
pub enum ProxyResult {
    /// Backend answered below 500; relayed verbatim.
    Forwarded {
        response: BackendResponse,
        state: CircuitState,
        elapsed: Duration,
    },
    /// Backend call failed and was counted against the breaker.
    BackendFailure {
        service: String,
        error: InvokeError,
        state: CircuitState,
        elapsed: Duration,
    },
    /// Breaker refused the call; the backend was not contacted.
    Fallback {
        service: String,
        state: CircuitState,
    },
    UnknownService {
        service: String,
    },
}

impl ProxyResult {
    /// Short label used for metrics and the access log.
    pub fn outcome(&self) -> &'static str {
        match self {
            ProxyResult::Forwarded { .. } => "forwarded",
            ProxyResult::BackendFailure {
                error: InvokeError::ServerError(_),
                ..
            } => "backend_error",
            ProxyResult::BackendFailure {
                error: InvokeError::Timeout(_),
                ..
            } => "timeout",
            ProxyResult::BackendFailure { .. } => "transport_error",
            ProxyResult::Fallback { .. } => "fallback",
            ProxyResult::UnknownService { .. } => "unknown_service",
        }
    }

    /// Breaker state at admission time, if a breaker was consulted.
    pub fn breaker_state(&self) -> Option<CircuitState> {
        match self {
            ProxyResult::Forwarded { state, .. }
            | ProxyResult::BackendFailure { state, .. }
            | ProxyResult::Fallback { state, .. } => Some(*state),
            ProxyResult::UnknownService { .. } => None,
        }
    }

    /// Why the caller did not get a clean backend answer, if it didn't.
    pub fn cause(&self) -> Option<GatewayError> {
        match self {
            ProxyResult::Forwarded { .. } => None,
            ProxyResult::BackendFailure { error, .. } => Some(error.cause()),
            ProxyResult::Fallback { service, .. } => {
                Some(GatewayError::CircuitOpen(service.clone()))
            }
            ProxyResult::UnknownService { service } => {
                Some(GatewayError::UnknownService(service.clone()))
            }
        }
    }

    pub fn upstream_elapsed(&self) -> Option<Duration> {
        match self {
            ProxyResult::Forwarded { elapsed, .. }
            | ProxyResult::BackendFailure { elapsed, .. } => Some(*elapsed),
            _ => None,
        }
    }

    /// Status code the caller will see.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyResult::Forwarded { response, .. } => response.status,
            ProxyResult::BackendFailure { error, .. } => match error {
                InvokeError::ServerError(resp) => resp.status,
                InvokeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                InvokeError::Transport(_) => StatusCode::BAD_GATEWAY,
            },
            ProxyResult::Fallback { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyResult::UnknownService { .. } => StatusCode::BAD_REQUEST,
        }
    }

    /// Build the downstream response.
    ///
    /// Backend answers (including 5xx) pass through with their status,
    /// headers and body. Everything else gets a small JSON error body.
    pub fn into_response(self) -> Response<BoxBody> {
        match self {
            ProxyResult::Forwarded { response, .. }
            | ProxyResult::BackendFailure {
                error: InvokeError::ServerError(response),
                ..
            } => relay(response),
            ProxyResult::BackendFailure {
                service,
                error: InvokeError::Timeout(_),
                ..
            } => json_response(
                StatusCode::GATEWAY_TIMEOUT,
                serde_json::json!({ "error": "Gateway timeout", "service": service }).to_string(),
            ),
            ProxyResult::BackendFailure { service, .. } => json_response(
                StatusCode::BAD_GATEWAY,
                serde_json::json!({ "error": "Bad gateway", "service": service }).to_string(),
            ),
            ProxyResult::Fallback { service, .. } => json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "error": "Service unavailable",
                    "service": service,
                    "fallback": true,
                })
                .to_string(),
            ),
            ProxyResult::UnknownService { service } => json_response(
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": format!("Unknown service: {}", service) }).to_string(),
            ),
        }
    }
}

fn relay(backend: BackendResponse) -> Response<BoxBody> {
    let mut resp = Response::new(full_body(backend.body));
    *resp.status_mut() = backend.status;
    *resp.headers_mut() = backend.headers;
    resp
}

/// Routes a request to its backend through that service's circuit breaker.
pub struct ProxyDispatcher<I> {
    routes: RouteRegistry,
    breakers: Arc<BreakerRegistry>,
    invoker: I,
}

impl<I: BackendInvoker> ProxyDispatcher<I> {
    pub fn new(routes: RouteRegistry, breakers: Arc<BreakerRegistry>, invoker: I) -> Self {
        Self {
            routes,
            breakers,
            invoker,
        }
    }

    pub fn routes(&self) -> &RouteRegistry {
        &self.routes
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn invoker(&self) -> &I {
        &self.invoker
    }

    /// Dispatch one request.
    ///
    /// Unknown services are answered without touching the breaker registry.
    /// A rejected call never reaches the invoker. Every admitted call is
    /// recorded exactly once against the breaker that admitted it.
    pub async fn handle(&self, service_id: &str, req: InboundRequest) -> ProxyResult {
        let Some(route) = self.routes.resolve(service_id) else {
            warn!("proxy: unknown service, service={}", service_id);
            metrics::counter!("gateway_unknown_service_total").increment(1);
            return ProxyResult::UnknownService {
                service: service_id.to_string(),
            };
        };

        let breaker = self.breakers.get(service_id);
        let permit = match breaker.try_acquire() {
            CallPermission::Granted(permit) => permit,
            CallPermission::Rejected(state) => {
                warn!(
                    "proxy: circuit breaker rejected call, serving fallback, service={}, state={}",
                    service_id, state
                );
                metrics::counter!(
                    "gateway_circuit_breaker_rejected_total",
                    "service" => service_id.to_string(),
                )
                .increment(1);
                return ProxyResult::Fallback {
                    service: service_id.to_string(),
                    state,
                };
            }
        };
        let state = permit.state();

        let path = forwarded_path(service_id, &req.path);
        let url = target_url(&route.base_url, path, req.query.as_deref());

        let mut headers = req.headers;
        sanitize_request_headers(&mut headers);
        headers.remove(CONTENT_LENGTH);
        let body = if method_has_body(&req.method) && !req.body.is_empty() {
            Some(req.body)
        } else {
            None
        };

        debug!(
            "proxy: forwarding, service={}, method={}, url={}, state={}, trial={}",
            service_id,
            req.method,
            url,
            state,
            permit.is_trial()
        );

        let started = Instant::now();
        let result = self
            .invoker
            .invoke(BackendRequest {
                method: req.method,
                url,
                headers,
                body,
                timeout: route.timeout,
            })
            .await;
        let elapsed = started.elapsed();

        match result {
            Ok(response) => {
                permit.record_success(elapsed);
                ProxyResult::Forwarded {
                    response,
                    state,
                    elapsed,
                }
            }
            Err(error) => {
                let cause = error.cause();
                warn!(
                    "proxy: backend call failed, service={}, error={}, elapsed_ms={}",
                    service_id,
                    cause,
                    elapsed.as_millis()
                );
                permit.record_failure(elapsed, &cause);
                ProxyResult::BackendFailure {
                    service: service_id.to_string(),
                    error,
                    state,
                    elapsed,
                }
            }
        }
    }
}
