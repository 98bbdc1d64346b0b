use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use paygate::admin::{self, AdminState};
use paygate::config::AppConfig;
use paygate::dispatcher::Dispatcher;
use paygate::gate::Gate;
use paygate::middleware::{content_type_validation_middleware, metrics_handler, metrics_middleware, security_headers_middleware};
use paygate::models::{KeyGroup, PersistedState, QuotaConfig};
use paygate::proxy::Proxy;
use paygate::services::audit_log::AuditLog;
use paygate::services::circuit_breaker::CircuitBreaker;
use paygate::services::expiry_scanner::ExpiryScanner;
use paygate::services::ip_access_controller::IpAccessController;
use paygate::services::key_group_manager::KeyGroupManager;
use paygate::services::key_store::KeyStore;
use paygate::services::quota_tracker::QuotaTracker;
use paygate::services::rate_limiter::RateLimiter;
use paygate::services::request_signer::RequestSigner;
use paygate::services::response_cache::ResponseCache;
use paygate::services::spend_cap_manager::SpendCapManager;
use paygate::services::usage_meter::UsageMeter;
use paygate::services::webhook_queue::WebhookQueue;

#[derive(Clone)]
struct McpState {
    dispatcher: Arc<Dispatcher>,
    maintenance_mode: Arc<AtomicBool>,
}

/// `POST /mcp` — the single JSON-RPC entrypoint (§4.16, §6). Header
/// extraction lives here; all admission/billing/proxying decisions are the
/// Dispatcher's.
async fn mcp_handler(
    State(state): State<McpState>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    if state.maintenance_mode.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "maintenance mode").into_response();
    }

    let api_key_id = headers.get("x-api-key").and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
    let signature_header = headers.get("x-signature").and_then(|v| v.to_str().ok()).map(|s| s.to_string());
    let content_length =
        headers.get(header::CONTENT_LENGTH).and_then(|v| v.to_str().ok()).and_then(|s| s.parse::<usize>().ok());

    match state
        .dispatcher
        .handle(&headers, Some(peer.ip()), content_length, &api_key_id, signature_header.as_deref(), &body)
        .await
    {
        Ok(outcome) => {
            let mut response = Json(outcome.response).into_response();
            if let Ok(value) = HeaderValue::from_str(&outcome.request_id) {
                response.headers_mut().insert("x-request-id", value);
            }
            response
        }
        Err(err) => err.into_response(),
    }
}

/// Groups aren't owned by `KeyStore`, so a startup read of the same snapshot
/// file seeds `KeyGroupManager` independently of `KeyStore::load`.
fn load_persisted_groups(path: &str) -> Vec<KeyGroup> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice::<PersistedState>(&bytes).map(|p| p.groups).unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "paygate=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(AppConfig::from_env()?);

    let key_store = Arc::new(KeyStore::load(config.state_file_path.clone()));
    let key_groups = Arc::new(KeyGroupManager::load(load_persisted_groups(&config.state_file_path)));
    let audit_log = Arc::new(AuditLog::new(config.audit_log_retention));
    key_store.attach_persistence(audit_log.clone(), key_groups.clone());
    let rate_limiter = Arc::new(RateLimiter::new());
    let quota_tracker = Arc::new(QuotaTracker::new(QuotaConfig {
        daily_call_limit: config.default_daily_call_limit,
        monthly_call_limit: config.default_monthly_call_limit,
        daily_credit_limit: config.default_daily_credit_limit,
        monthly_credit_limit: config.default_monthly_credit_limit,
    }));
    let spend_cap_manager = Arc::new(SpendCapManager::new(
        config.server_daily_call_cap,
        config.server_daily_credit_cap,
        config.hourly_call_cap,
        config.hourly_credit_cap,
        config.breach_action_suspend,
        config.auto_resume_after_seconds,
    ));
    let ip_access_controller = Arc::new(IpAccessController::new(
        config.ip_access_enabled,
        config.ip_global_allowlist.clone(),
        config.ip_global_denylist.clone(),
        config.auto_block_threshold,
        config.auto_block_duration_ms,
        config.trusted_proxy_depth,
    ));
    let request_signer = Arc::new(RequestSigner::new(
        config.signing_enabled,
        config.signature_tolerance_ms,
        config.nonce_window_ms,
        config.nonce_table_cap,
    ));
    let circuit_breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker_threshold, config.circuit_breaker_cooldown_seconds));
    let response_cache = Arc::new(ResponseCache::new(config.response_cache_cap));
    let usage_meter = Arc::new(UsageMeter::new(config.usage_event_retention));
    let webhook_queue = Arc::new(WebhookQueue::new(config.usage_event_retention));

    let gate = Arc::new(Gate::new(
        config.clone(),
        key_store.clone(),
        rate_limiter.clone(),
        quota_tracker.clone(),
        spend_cap_manager.clone(),
        ip_access_controller.clone(),
        request_signer.clone(),
        key_groups.clone(),
        circuit_breaker.clone(),
        audit_log.clone(),
    ));

    let proxy = Arc::new(Proxy::spawn(&config.backend)?);

    let dispatcher = Arc::new(Dispatcher::new(
        config.clone(),
        gate.clone(),
        proxy.clone(),
        response_cache.clone(),
        usage_meter.clone(),
        webhook_queue.clone(),
    ));

    let maintenance_mode = Arc::new(AtomicBool::new(false));

    // Periodic snapshot flush — a backstop on top of the per-mutation
    // background persist each `KeyStore`/admin write already fires, in case
    // one of those background writes is still dropped by a process exit.
    {
        let key_store = key_store.clone();
        let key_groups = key_groups.clone();
        let interval = config.snapshot_flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                key_store.persist(key_groups.list()).await;
            }
        });
    }

    // Expiry notification sweep (§4.14).
    Arc::new(ExpiryScanner::new()).spawn(key_store.clone(), audit_log.clone(), Duration::from_secs(config.expiry_scan_interval_seconds));

    let mcp_state = McpState { dispatcher: dispatcher.clone(), maintenance_mode: maintenance_mode.clone() };

    let admin_state =
        AdminState { key_store: key_store.clone(), key_groups: key_groups.clone(), audit_log: audit_log.clone(), dispatcher: dispatcher.clone(), maintenance_mode: maintenance_mode.clone() };

    let cors_origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("invalid CORS origin '{}': {}", origin, e);
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(cors_origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, "x-api-key".parse().unwrap(), "x-signature".parse().unwrap(), "x-admin-key".parse().unwrap()]);

    let app = Router::new()
        .route("/mcp", post(mcp_handler))
        .with_state(mcp_state)
        .route("/metrics", get(metrics_handler))
        .nest("/admin", admin::router(admin_state, config.clone()))
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(metrics_middleware))
                .layer(middleware::from_fn(content_type_validation_middleware))
                .layer(middleware::from_fn(security_headers_middleware))
                .layer(cors),
        );

    let addr: SocketAddr = config.bind_addr.parse()?;
    tracing::info!("paygate listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
