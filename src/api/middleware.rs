//! Request id and access log middleware.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header::HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::{info, Span};
use uuid::Uuid;

/// Header name for request ID.
pub static REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Request ID extension for extracting in handlers.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Settings shared by the request middleware.
///
/// Environment:
/// - FLOWCHECK_TRUST_REQUEST_ID: keep an incoming `x-request-id` (default: false)
/// - FLOWCHECK_ACCESS_LOG: set to "false" to disable access logging (default: true)
#[derive(Clone, Debug)]
pub struct RequestLogConfig {
    pub trust_incoming_id: bool,
    pub access_log: bool,
}

impl Default for RequestLogConfig {
    fn default() -> Self {
        Self {
            trust_incoming_id: std::env::var("FLOWCHECK_TRUST_REQUEST_ID")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            access_log: std::env::var("FLOWCHECK_ACCESS_LOG")
                .map(|v| !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
        }
    }
}

/// Ensure every request carries a request id.
///
/// The id is stored as a [`RequestId`] extension, recorded on the current
/// span and echoed in the response headers.
pub async fn request_id_middleware(
    State(config): State<RequestLogConfig>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let incoming = config
        .trust_incoming_id
        .then(|| {
            request
                .headers()
                .get(&REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
        .flatten();
    let request_id = incoming.unwrap_or_else(|| Uuid::new_v4().to_string());

    Span::current().record("request_id", &request_id);
    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(REQUEST_ID_HEADER.clone(), header_value);
    }

    response
}

/// Log one structured line per request.
///
/// For SSE responses the line is written when headers are sent, so the
/// duration does not cover the stream itself.
pub async fn access_log_middleware(
    State(config): State<RequestLogConfig>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !config.access_log {
        return next.run(request).await;
    }

    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(|q| q.to_string());
    let request_id = request.extensions().get::<RequestId>().map(|r| r.0.clone());

    let response = next.run(request).await;

    info!(
        target: "flowcheck::access",
        method = %method,
        path = %path,
        query = ?query,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        request_id = ?request_id,
        "request completed"
    );

    response
}
