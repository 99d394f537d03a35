use super::GatewayState;
use crate::proxy::context::{full_body, json_response, BoxBody};
use crate::upstream::CircuitBreaker;
use http::{Method, StatusCode};
use hyper::body::Incoming;
use hyper::{Request, Response};
use tracing::info;

pub fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    Ok(route_admin(req.method(), req.uri().path(), &state))
}

fn route_admin(method: &Method, path: &str, state: &GatewayState) -> Response<BoxBody> {
    if let Some(rest) = path.strip_prefix("/breakers/") {
        return breaker_action(method, rest, state);
    }

    match path {
        "/health" | "/healthz" => json_response(StatusCode::OK, r#"{"status":"ok"}"#),

        "/ready" | "/readyz" => json_response(
            StatusCode::OK,
            serde_json::json!({ "status": "ready", "services": state.routes.len() }).to_string(),
        ),

        "/metrics" => {
            let mut resp = Response::new(full_body(state.metrics.render()));
            resp.headers_mut().insert(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            resp
        }

        "/services" => {
            let services: Vec<serde_json::Value> = state
                .routes
                .all_routes()
                .iter()
                .map(|r| {
                    let cb = state.config.breaker_config_for(&r.service_id);
                    serde_json::json!({
                        "id": r.service_id,
                        "url": r.base_url,
                        "timeout_ms": r.timeout.as_millis() as u64,
                        "circuit_breaker": {
                            "failure_rate_threshold": cb.failure_rate_threshold,
                            "sliding_window_size": cb.sliding_window_size,
                            "minimum_calls": cb.minimum_calls,
                            "wait_duration_in_open_ms": cb.wait_duration_in_open.as_millis() as u64,
                            "permitted_calls_in_half_open": cb.permitted_calls_in_half_open,
                        },
                    })
                })
                .collect();
            pretty_json(&services)
        }

        "/breakers" => {
            let breakers: Vec<serde_json::Value> = state
                .breakers
                .snapshot()
                .iter()
                .map(|cb| breaker_json(cb))
                .collect();
            pretty_json(&breakers)
        }

        _ => not_found(),
    }
}

/// `POST /breakers/{id}/{force-open|disable|reset}`
fn breaker_action(method: &Method, rest: &str, state: &GatewayState) -> Response<BoxBody> {
    let Some((service_id, action)) = rest.split_once('/') else {
        return not_found();
    };
    if !state.routes.contains(service_id) {
        return json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": format!("Unknown service: {}", service_id) })
                .to_string(),
        );
    }
    if method != Method::POST {
        return json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            r#"{"error":"method not allowed"}"#,
        );
    }

    let apply: fn(&CircuitBreaker) = match action {
        "force-open" => CircuitBreaker::transition_to_forced_open,
        "disable" => CircuitBreaker::transition_to_disabled,
        "reset" => CircuitBreaker::reset,
        _ => return not_found(),
    };
    let breaker = state.breakers.get(service_id);
    apply(&breaker);
    info!(
        "admin: breaker override applied, service={}, action={}, state={}",
        service_id,
        action,
        breaker.current_state()
    );

    json_response(StatusCode::OK, breaker_json(&breaker).to_string())
}

fn breaker_json(cb: &CircuitBreaker) -> serde_json::Value {
    let m = cb.metrics();
    serde_json::json!({
        "service": cb.name(),
        "state": cb.current_state().as_str(),
        "buffered_calls": m.buffered_calls,
        "failed_calls": m.failed_calls,
        "failure_rate": m.failure_rate,
        "not_permitted_calls": m.not_permitted_calls,
        "mean_call_duration_ms": m.mean_call_duration.as_secs_f64() * 1000.0,
        "last_call_age_ms": m.last_call_age.map(|age| age.as_millis() as u64),
    })
}

fn pretty_json<T: serde::Serialize>(value: &T) -> Response<BoxBody> {
    let body = serde_json::to_string_pretty(value).unwrap_or_default();
    json_response(StatusCode::OK, body)
}

fn not_found() -> Response<BoxBody> {
    json_response(StatusCode::NOT_FOUND, r#"{"error":"not found"}"#)
}
