//! Request-id propagation and optional request logging.

use axum::body::HttpBody;
use axum::extract::Request;
use axum::http::header::{HeaderValue, HOST, USER_AGENT};
use axum::middleware::Next;
use axum::response::Response;
use rand::Rng;

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Honors an incoming `X-Request-Id`, generating a 16-byte random hex id
/// when absent, and echoes it on the response.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(next_request_id);

    request.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

pub fn next_request_id() -> String {
    let mut buf = [0u8; 16];
    rand::thread_rng().fill(&mut buf);
    hex::encode(buf)
}

pub async fn request_logging(request: Request, next: Next) -> Response {
    let started_at = std::time::Instant::now();

    let method = request.method().clone();
    let request_uri = request.uri().clone();
    let host = header_value(&request, HOST);
    let user_agent = header_value(&request, USER_AGENT);
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let response = next.run(request).await;

    // handlers respond with fully buffered bodies, so the size hint is exact
    let bytes = response.body().size_hint().exact().unwrap_or(0);

    tracing::info!(
        host = %host,
        method = %method,
        request_uri = %request_uri,
        status = response.status().as_u16(),
        bytes,
        user_agent = %user_agent,
        request_id = %request_id,
        duration_ns = started_at.elapsed().as_nanos() as i64,
        "request"
    );

    response
}

fn header_value(request: &Request, name: axum::http::header::HeaderName) -> String {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_request_id_is_16_random_bytes_hex() {
        let id = next_request_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, next_request_id());
    }
}
