//! Security headers applied to every response (§6): a fixed, minimal set
//! rather than the permissive browser-app defaults a CSP-heavy frontend would
//! need, since PayGate serves a single JSON-RPC endpoint and an admin API, not
//! HTML. Grounded in the teacher's `security_headers_middleware` shape (one
//! middleware inserting a fixed header block onto every response, with
//! `X-Powered-By` stripped), the header values themselves replaced outright.

use axum::{
    extract::Request,
    http::{header, HeaderValue},
    middleware::Next,
    response::Response,
};

fn is_valid_request_id(v: &str) -> bool {
    v.strip_prefix("req_")
        .map(|hex| hex.len() == 16 && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    format!("req_{}", hex::encode(bytes))
}

pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let inbound_request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| is_valid_request_id(v))
        .map(|s| s.to_string());

    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(header::X_XSS_PROTECTION, HeaderValue::from_static("0"));
    headers.insert(header::REFERRER_POLICY, HeaderValue::from_static("strict-origin-when-cross-origin"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );

    // The /mcp handler sets this itself from the dispatched request id; any
    // other route gets the inbound id echoed back if well-formed, else a
    // freshly generated one.
    if !headers.contains_key("x-request-id") {
        let id = inbound_request_id.unwrap_or_else(generate_request_id);
        if let Ok(value) = HeaderValue::from_str(&id) {
            headers.insert("x-request-id", value);
        }
    }

    headers.remove(header::HeaderName::from_static("x-powered-by"));

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request as HttpRequest, routing::get, Router};
    use tower::ServiceExt;

    async fn test_handler() -> &'static str {
        "OK"
    }

    fn app() -> Router {
        Router::new().route("/", get(test_handler)).layer(axum::middleware::from_fn(security_headers_middleware))
    }

    #[tokio::test]
    async fn applies_fixed_header_set() {
        let response = app().oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap()).await.unwrap();
        let headers = response.headers();

        assert_eq!(headers.get(header::X_CONTENT_TYPE_OPTIONS).unwrap(), "nosniff");
        assert_eq!(headers.get(header::X_FRAME_OPTIONS).unwrap(), "DENY");
        assert_eq!(headers.get(header::X_XSS_PROTECTION).unwrap(), "0");
        assert_eq!(headers.get(header::REFERRER_POLICY).unwrap(), "strict-origin-when-cross-origin");
        assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), "no-store");
        assert_eq!(headers.get(header::CONTENT_SECURITY_POLICY).unwrap(), "default-src 'none'; frame-ancestors 'none'");
        assert!(!headers.contains_key("x-powered-by"));
    }

    #[tokio::test]
    async fn generates_request_id_when_absent() {
        let response = app().oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap()).await.unwrap();
        let id = response.headers().get("x-request-id").unwrap().to_str().unwrap();
        assert!(is_valid_request_id(id));
    }

    #[tokio::test]
    async fn echoes_well_formed_inbound_request_id() {
        let response = app()
            .oneshot(
                HttpRequest::builder()
                    .uri("/")
                    .header("x-request-id", "req_0123456789abcdef")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers().get("x-request-id").unwrap(), "req_0123456789abcdef");
    }

    #[tokio::test]
    async fn ignores_malformed_inbound_request_id() {
        let response = app()
            .oneshot(HttpRequest::builder().uri("/").header("x-request-id", "not-valid").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let id = response.headers().get("x-request-id").unwrap().to_str().unwrap();
        assert_ne!(id, "not-valid");
        assert!(is_valid_request_id(id));
    }
}
