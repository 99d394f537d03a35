use bytes::Bytes;
use http::{HeaderValue, StatusCode};
use http_body_util::{BodyExt, Full};
use std::time::{Duration, Instant};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// JSON response with the given status.
pub fn json_response(status: StatusCode, body: impl Into<Bytes>) -> hyper::Response<BoxBody> {
    let mut resp = hyper::Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}

/// Per-request bookkeeping for metrics and the access log.
pub struct RequestContext {
    pub method: String,
    pub uri_path: String,
    pub service_id: String,
    pub start: Instant,
    pub upstream_elapsed: Option<Duration>,
}

impl RequestContext {
    pub fn new(method: String, uri_path: String) -> Self {
        Self {
            method,
            uri_path,
            service_id: String::new(),
            start: Instant::now(),
            upstream_elapsed: None,
        }
    }

    pub fn error_response(&self, status: StatusCode, body: String) -> hyper::Response<BoxBody> {
        self.finalize(status.as_u16(), "rejected", None);
        json_response(status, body)
    }

    /// Record request metrics and emit the access log line.
    pub fn finalize(&self, resp_status: u16, outcome: &'static str, breaker_state: Option<&str>) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "gateway_http_requests_total",
            "service" => self.service_id.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
            "outcome" => outcome,
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "service" => self.service_id.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream) = self.upstream_elapsed {
            metrics::histogram!(
                "gateway_upstream_request_duration_seconds",
                "service" => self.service_id.clone(),
            )
            .record(upstream.as_secs_f64());
        }

        tracing::info!(
            method = %self.method,
            path = %self.uri_path,
            service = %self.service_id,
            status = resp_status,
            outcome = outcome,
            breaker = breaker_state.unwrap_or("-"),
            latency_ms = %self.start.elapsed().as_millis(),
            upstream_ms = %self.upstream_elapsed.map(|d| d.as_millis()).unwrap_or(0),
            "access"
        );
    }
}
