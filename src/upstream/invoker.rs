use crate::error::GatewayError;
use crate::proxy::context::{empty_body, full_body, BoxBody};
use bytes::Bytes;
use http::header::{CONNECTION, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Limited};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::time::Duration;

/// One outbound call, fully resolved.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub method: Method,
    /// `baseUrl + forwardedPath (+ "?" + query)`.
    pub url: String,
    /// Inbound headers minus `Host` and hop-by-hop headers.
    pub headers: HeaderMap,
    /// Present only for POST/PUT/PATCH.
    pub body: Option<Bytes>,
    pub timeout: Duration,
}

/// A backend answer the caller should see verbatim (2xx, 3xx, 4xx).
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A call that counts as failed against the breaker.
#[derive(Debug)]
pub enum InvokeError {
    /// Backend answered 5xx; the response is kept so it can be surfaced.
    ServerError(BackendResponse),
    Timeout(Duration),
    Transport(String),
}

impl InvokeError {
    pub fn cause(&self) -> GatewayError {
        match self {
            InvokeError::ServerError(resp) => GatewayError::UpstreamStatus(resp.status.as_u16()),
            InvokeError::Timeout(_) => GatewayError::UpstreamTimeout,
            InvokeError::Transport(msg) => GatewayError::UpstreamConnect(msg.clone()),
        }
    }
}

/// Performs one backend call. Knows nothing about breakers.
pub trait BackendInvoker: Send + Sync {
    fn invoke(
        &self,
        req: BackendRequest,
    ) -> impl Future<Output = Result<BackendResponse, InvokeError>> + Send;
}

/// 5xx is a failure; everything else passes through.
pub fn classify(resp: BackendResponse) -> Result<BackendResponse, InvokeError> {
    if is_server_error(resp.status) {
        Err(InvokeError::ServerError(resp))
    } else {
        Ok(resp)
    }
}

pub fn is_server_error(status: StatusCode) -> bool {
    status.is_server_error()
}

/// Methods whose inbound body is forwarded.
pub fn method_has_body(method: &Method) -> bool {
    method == Method::POST || method == Method::PUT || method == Method::PATCH
}

/// Drop `Host` and hop-by-hop headers before forwarding.
pub fn sanitize_request_headers(headers: &mut HeaderMap) {
    headers.remove(HOST);
    remove_hop_headers(headers);
}

pub fn remove_hop_headers(headers: &mut HeaderMap) {
    // Names listed in `Connection` are hop-by-hop for this message too.
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for h in &listed {
        headers.remove(h);
    }

    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("proxy-connection"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

/// hyper-based invoker with a pooled client shared by all services.
#[derive(Clone)]
pub struct HttpInvoker {
    client: Client<HttpsConnector<HttpConnector>, BoxBody>,
    max_body_bytes: usize,
}

impl HttpInvoker {
    pub fn new(max_body_bytes: u64) -> Self {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.set_keepalive(Some(Duration::from_secs(60)));
        http.enforce_http(false);

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(60))
            .build(https);

        Self {
            client,
            max_body_bytes: usize::try_from(max_body_bytes).unwrap_or(usize::MAX),
        }
    }

    async fn send(&self, req: BackendRequest) -> Result<BackendResponse, InvokeError> {
        let uri: Uri = req
            .url
            .parse()
            .map_err(|e| InvokeError::Transport(format!("invalid upstream uri: {}", e)))?;

        let body = match req.body {
            Some(bytes) => full_body(bytes),
            None => empty_body(),
        };
        let mut upstream_req = Request::new(body);
        *upstream_req.method_mut() = req.method;
        *upstream_req.uri_mut() = uri;
        *upstream_req.headers_mut() = req.headers;

        let resp = self
            .client
            .request(upstream_req)
            .await
            .map_err(|e| InvokeError::Transport(error_chain(&e)))?;

        let (parts, body) = resp.into_parts();
        let body = Limited::new(body, self.max_body_bytes)
            .collect()
            .await
            .map_err(|e| InvokeError::Transport(format!("reading response body: {}", e)))?
            .to_bytes();

        let mut headers = parts.headers;
        remove_hop_headers(&mut headers);

        Ok(BackendResponse {
            status: parts.status,
            headers,
            body,
        })
    }
}

impl BackendInvoker for HttpInvoker {
    async fn invoke(&self, req: BackendRequest) -> Result<BackendResponse, InvokeError> {
        let timeout = req.timeout;
        match tokio::time::timeout(timeout, self.send(req)).await {
            Ok(result) => classify(result?),
            Err(_) => Err(InvokeError::Timeout(timeout)),
        }
    }
}

/// Flatten an error and its sources into one line.
fn error_chain(e: &(dyn std::error::Error + 'static)) -> String {
    let mut msg = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        msg.push_str(": ");
        msg.push_str(&s.to_string());
        source = s.source();
    }
    msg
}
