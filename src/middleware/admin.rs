//! Admin-surface gate: every `/admin/*` route requires header `X-Admin-Key`
//! to match the configured secret (§6). Grounded in the teacher's
//! `admin_middleware` (role check layered onto the router after auth), but
//! replaces the JWT-role check with a single shared-secret header, since the
//! admin surface has no per-user identity of its own. Comparison is
//! constant-time via `subtle`, the same crate `RequestSigner` uses.

use axum::{extract::Request, extract::State, http::StatusCode, middleware::Next, response::Response};
use subtle::ConstantTimeEq;

use crate::config::AppConfig;

pub async fn admin_key_middleware(
    State(config): State<std::sync::Arc<AppConfig>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let provided = request
        .headers()
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let expected = config.admin_key.as_bytes();
    let matches = provided.len() == expected.len()
        && provided.as_bytes().ct_eq(expected).unwrap_u8() == 1;

    if !matches {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request as HttpRequest, routing::get, Router};
    use tower::ServiceExt;

    fn config() -> std::sync::Arc<AppConfig> {
        std::sync::Arc::new(AppConfig {
            bind_addr: "0.0.0.0:0".into(),
            admin_key: "s3cret".into(),
            state_file_path: "state.json".into(),
            snapshot_flush_interval: std::time::Duration::from_secs(30),
            backend: crate::config::BackendTransportConfig::ChildProcess { command: "cat".into(), args: vec![] },
            default_credits_per_call: 1,
            default_credits_per_kb_input: 0,
            default_credits_per_kb_output: 0,
            default_cache_ttl_seconds: 0,
            default_daily_call_limit: 0,
            default_monthly_call_limit: 0,
            default_daily_credit_limit: 0,
            default_monthly_credit_limit: 0,
            server_daily_call_cap: 0,
            server_daily_credit_cap: 0,
            hourly_call_cap: 0,
            hourly_credit_cap: 0,
            breach_action_suspend: true,
            auto_resume_after_seconds: 0,
            global_rate_limit_per_min: 0,
            ip_access_enabled: false,
            ip_global_allowlist: vec![],
            ip_global_denylist: vec![],
            auto_block_threshold: 10,
            auto_block_duration_ms: 60_000,
            trusted_proxy_depth: 0,
            signing_enabled: false,
            signature_tolerance_ms: 300_000,
            nonce_window_ms: 300_000,
            nonce_table_cap: 1000,
            response_cache_cap: 1000,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_seconds: 30,
            usage_event_retention: 1000,
            audit_log_retention: 1000,
            refund_on_failure: true,
            shadow_mode: false,
            tool_timeout_ms: 5_000,
            request_timeout_ms: 60_000,
            headers_timeout_ms: 10_000,
            country_header_name: "x-geo-country".into(),
            free_methods: vec![],
            cors_origins: vec![],
            max_request_body_bytes: 1024 * 1024,
            expiry_scan_interval_seconds: 3600,
        })
    }

    async fn handler() -> &'static str {
        "ok"
    }

    fn app() -> Router {
        let cfg = config();
        Router::new()
            .route("/admin/ping", get(handler))
            .layer(axum::middleware::from_fn_with_state(cfg.clone(), admin_key_middleware))
            .with_state(cfg)
    }

    #[tokio::test]
    async fn rejects_missing_header() {
        let response = app()
            .oneshot(HttpRequest::builder().uri("/admin/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_wrong_key() {
        let response = app()
            .oneshot(
                HttpRequest::builder()
                    .uri("/admin/ping")
                    .header("x-admin-key", "wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn accepts_correct_key() {
        let response = app()
            .oneshot(
                HttpRequest::builder()
                    .uri("/admin/ping")
                    .header("x-admin-key", "s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
