use crate::error::GatewayError;
use crate::proxy::context::{BoxBody, RequestContext};
use crate::proxy::dispatcher::{InboundRequest, ProxyDispatcher, ProxyResult};
use crate::routing::split_proxy_path;
use crate::upstream::invoker::method_has_body;
use crate::upstream::BackendInvoker;
use bytes::Bytes;
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::{Request, Response};
use std::net::SocketAddr;
use tracing::{debug, warn};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const UNKNOWN_SERVICE_LABEL: &str = "_unknown";

/// Handle one inbound request on the proxy listener:
///
/// 1. ROUTE_MATCH: `/proxy/{serviceId}/{*path}`, anything else is 404
/// 2. BODY: buffer the body for POST/PUT/PATCH to a known service, bounded
///    by `max_body_bytes`
/// 3. DISPATCH: breaker admission and backend call
/// 4. LOG: finalize metrics and the access log
pub async fn handle_request<B, I>(
    req: Request<B>,
    dispatcher: &ProxyDispatcher<I>,
    max_body_bytes: u64,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    I: BackendInvoker,
{
    let (parts, body) = req.into_parts();
    let uri_path = parts.uri.path().to_string();
    let mut ctx = RequestContext::new(parts.method.as_str().to_string(), uri_path.clone());

    // Route match
    let Some((service_id, _)) = split_proxy_path(&uri_path) else {
        debug!("proxy: no route, path={}", uri_path);
        return Ok(ctx.error_response(
            StatusCode::NOT_FOUND,
            r#"{"error":"not found"}"#.to_string(),
        ));
    };
    // Unknown ids fail fast: no body read, and no arbitrary metric labels.
    let known = dispatcher.routes().contains(service_id);
    ctx.service_id = if known {
        service_id.to_string()
    } else {
        UNKNOWN_SERVICE_LABEL.to_string()
    };

    // Body
    let body = if known && method_has_body(&parts.method) {
        match read_body(body, &parts.headers, max_body_bytes).await {
            Ok(bytes) => bytes,
            Err(GatewayError::BodyTooLarge) => {
                warn!(
                    "proxy: request body too large, service={}, limit={}",
                    service_id, max_body_bytes
                );
                return Ok(ctx.error_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    r#"{"error":"Payload too large"}"#.to_string(),
                ));
            }
            Err(e) => {
                warn!(
                    "proxy: failed to read request body, service={}, error={}",
                    service_id, e
                );
                return Ok(ctx.error_response(
                    StatusCode::BAD_REQUEST,
                    r#"{"error":"Invalid request body"}"#.to_string(),
                ));
            }
        }
    } else {
        Bytes::new()
    };

    let mut headers = parts.headers;
    append_forwarded_for(&mut headers, peer_addr);

    // Dispatch
    let result = dispatcher
        .handle(
            service_id,
            InboundRequest {
                method: parts.method,
                path: uri_path.clone(),
                query: parts.uri.query().map(str::to_string),
                headers,
                body,
            },
        )
        .await;

    // Log
    if let Some(cause) = result.cause() {
        debug!("proxy: request not forwarded cleanly, path={}, cause={}", uri_path, cause);
    }
    if let ProxyResult::UnknownService { .. } = result {
        ctx.service_id = UNKNOWN_SERVICE_LABEL.to_string();
    }
    ctx.upstream_elapsed = result.upstream_elapsed();
    ctx.finalize(
        result.status().as_u16(),
        result.outcome(),
        result.breaker_state().map(|s| s.as_str()),
    );

    Ok(result.into_response())
}

/// Buffer the request body, rejecting anything over `limit` bytes.
async fn read_body<B>(body: B, headers: &HeaderMap, limit: u64) -> Result<Bytes, GatewayError>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit) {
        return Err(GatewayError::BodyTooLarge);
    }

    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(GatewayError::BodyTooLarge)
        }
        Err(e) => Err(GatewayError::Internal(e.to_string())),
    }
}

/// Append the TCP peer to `X-Forwarded-For`.
fn append_forwarded_for(headers: &mut HeaderMap, peer_addr: SocketAddr) {
    let peer_ip = peer_addr.ip().to_string();
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{}, {}", existing, peer_ip),
        None => peer_ip,
    };
    if let Ok(v) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, v);
    }
}
