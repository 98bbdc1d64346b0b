//! End-to-end coverage of the admission pipeline through `Dispatcher`, for
//! the scenarios the per-module unit tests don't already exercise: key
//! expiry and recovery, shadow mode's allow-with-annotation, group/key
//! policy resolution, and single-flight cache coalescing. `cat` and a tiny
//! `sh` echo loop stand in for a real MCP backend, the same idiom as
//! `proxy::tests::child_process_echo_round_trip`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use paygate::config::{AppConfig, BackendTransportConfig};
use paygate::dispatcher::Dispatcher;
use paygate::gate::Gate;
use paygate::models::KeyGroup;
use paygate::proxy::Proxy;
use paygate::services::audit_log::AuditLog;
use paygate::services::circuit_breaker::CircuitBreaker;
use paygate::services::ip_access_controller::IpAccessController;
use paygate::services::key_group_manager::KeyGroupManager;
use paygate::services::key_store::{CreateKeyParams, KeyStore};
use paygate::services::quota_tracker::QuotaTracker;
use paygate::services::rate_limiter::RateLimiter;
use paygate::services::request_signer::RequestSigner;
use paygate::services::response_cache::ResponseCache;
use paygate::services::spend_cap_manager::SpendCapManager;
use paygate::services::usage_meter::UsageMeter;
use paygate::services::webhook_queue::WebhookQueue;

fn tmp_state_path(label: &str) -> String {
    std::env::temp_dir().join(format!("paygate-it-{label}-{}.json", uuid::Uuid::new_v4())).to_string_lossy().to_string()
}

fn base_config(label: &str) -> AppConfig {
    AppConfig {
        bind_addr: "0.0.0.0:0".into(),
        admin_key: "test".into(),
        state_file_path: tmp_state_path(label),
        snapshot_flush_interval: Duration::from_secs(30),
        backend: BackendTransportConfig::ChildProcess { command: "cat".into(), args: vec![] },
        default_credits_per_call: 5,
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
    }
}

struct Harness {
    dispatcher: Dispatcher,
    key_store: Arc<KeyStore>,
    key_groups: Arc<KeyGroupManager>,
    usage_meter: Arc<UsageMeter>,
}

fn build(config: AppConfig) -> Harness {
    let config = Arc::new(config);
    let key_store = Arc::new(KeyStore::load(config.state_file_path.clone()));
    let key_groups = Arc::new(KeyGroupManager::new());
    let audit_log = Arc::new(AuditLog::new(1000));
    key_store.attach_persistence(audit_log.clone(), key_groups.clone());
    let gate = Arc::new(Gate::new(
        config.clone(),
        key_store.clone(),
        Arc::new(RateLimiter::new()),
        Arc::new(QuotaTracker::new(Default::default())),
        Arc::new(SpendCapManager::new(0, 0, 0, 0, true, 0)),
        Arc::new(IpAccessController::new(false, vec![], vec![], 10, 60_000, 0)),
        Arc::new(RequestSigner::new(false, 300_000, 300_000, 1000)),
        key_groups.clone(),
        Arc::new(CircuitBreaker::new(5, 30)),
        audit_log,
    ));
    let proxy = Arc::new(Proxy::spawn(&config.backend).unwrap());
    let usage_meter = Arc::new(UsageMeter::new(config.usage_event_retention));
    let dispatcher = Dispatcher::new(
        config.clone(),
        gate,
        proxy,
        Arc::new(ResponseCache::new(config.response_cache_cap)),
        usage_meter.clone(),
        Arc::new(WebhookQueue::new(100)),
    );
    Harness { dispatcher, key_store, key_groups, usage_meter }
}

fn tool_call_body(tool: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "jsonrpc": "2.0",
        "method": "tools/call",
        "params": { "name": tool, "arguments": {} },
        "id": 1,
    }))
    .unwrap()
}

#[tokio::test]
async fn expired_key_denied_then_admitted_after_expiry_cleared() {
    let harness = build(base_config("expiry"));
    let key = harness.key_store.create_key(CreateKeyParams { credits: 100, ..Default::default() }).unwrap();
    harness.key_store.set_expiry(&key.id, Some(chrono::Utc::now() - chrono::Duration::minutes(1)));

    let body = tool_call_body("echo");
    let outcome = harness.dispatcher.handle(&HeaderMap::new(), None, None, &key.id, None, &body).await.unwrap();
    let error = outcome.response.error.unwrap();
    assert!(error.message.contains("api_key_expired"));
    assert_eq!(harness.key_store.get_key_raw(&key.id).unwrap().credits, 100, "denied call must not charge credits");

    harness.key_store.set_expiry(&key.id, None);
    let outcome = harness.dispatcher.handle(&HeaderMap::new(), None, None, &key.id, None, &body).await.unwrap();
    assert!(outcome.response.error.is_none(), "key should be admitted once expiry is cleared");
    assert_eq!(harness.key_store.get_key_raw(&key.id).unwrap().credits, 95);
}

#[tokio::test]
async fn shadow_mode_allows_denied_call_but_records_original_outcome() {
    let mut config = base_config("shadow");
    config.shadow_mode = true;
    let harness = build(config);
    let key = harness.key_store.create_key(CreateKeyParams::default()).unwrap();
    harness.key_store.set_expiry(&key.id, Some(chrono::Utc::now() - chrono::Duration::minutes(1)));

    let body = tool_call_body("echo");
    let outcome = harness.dispatcher.handle(&HeaderMap::new(), None, None, &key.id, None, &body).await.unwrap();

    assert!(outcome.response.error.is_none(), "shadow mode must let the call through");
    assert_eq!(harness.key_store.get_key_raw(&key.id).unwrap().credits, 0, "shadow mode never charges credits");

    let events = harness.usage_meter.get_events(None, None);
    assert_eq!(events.len(), 1);
    assert!(!events[0].allowed, "usage event must record the original denial");
    assert_eq!(events[0].deny_reason.as_deref(), Some("api_key_expired"));
    assert_eq!(events[0].credits_charged, 0);
}

#[tokio::test]
async fn group_deny_list_unions_with_key_deny_list() {
    let harness = build(base_config("group"));
    let group = KeyGroup {
        id: "grp_shared".into(),
        name: "shared".into(),
        allowed_tools: HashSet::new(),
        denied_tools: ["dangerous_tool".to_string()].into_iter().collect(),
        rate_limit_per_min: 0,
        tool_pricing: Default::default(),
        quota: None,
        ip_allowlist: HashSet::new(),
        default_credits: 0,
        max_spending_limit: 0,
        tags: Default::default(),
    };
    harness.key_groups.create_group(group);

    let key = harness
        .key_store
        .create_key(CreateKeyParams { credits: 100, group_id: Some("grp_shared".into()), ..Default::default() })
        .unwrap();

    let denied_by_group = harness
        .dispatcher
        .handle(&HeaderMap::new(), None, None, &key.id, None, &tool_call_body("dangerous_tool"))
        .await
        .unwrap();
    assert!(denied_by_group.response.error.unwrap().message.contains("tool_denied"));

    let allowed = harness.dispatcher.handle(&HeaderMap::new(), None, None, &key.id, None, &tool_call_body("safe_tool")).await.unwrap();
    assert!(allowed.response.error.is_none());
}

#[tokio::test]
async fn concurrent_identical_calls_coalesce_into_one_backend_round_trip() {
    // A slow per-line echo: each call to the backend costs ~150ms. If the
    // second concurrent lookup actually reached the backend independently,
    // total wall time would be roughly double a single round trip.
    let counter_path = std::env::temp_dir().join(format!("paygate-it-cache-calls-{}.txt", uuid::Uuid::new_v4()));
    let _ = std::fs::remove_file(&counter_path);
    let script = format!(
        "while read -r line; do echo x >> {path}; sleep 0.15; echo \"$line\"; done",
        path = counter_path.display()
    );

    let mut config = base_config("cache");
    config.backend = BackendTransportConfig::ChildProcess { command: "sh".into(), args: vec!["-c".into(), script] };
    config.default_cache_ttl_seconds = 60;
    let harness = build(config);
    let key = harness.key_store.create_key(CreateKeyParams { credits: 100, ..Default::default() }).unwrap();

    let body = tool_call_body("slow_tool");
    let started = std::time::Instant::now();
    let (first, second) = tokio::join!(
        harness.dispatcher.handle(&HeaderMap::new(), None, None, &key.id, None, &body),
        harness.dispatcher.handle(&HeaderMap::new(), None, None, &key.id, None, &body),
    );
    let elapsed = started.elapsed();

    assert!(first.unwrap().response.error.is_none());
    assert!(second.unwrap().response.error.is_none());
    assert!(elapsed < Duration::from_millis(400), "second call should have waited on the in-flight result, not re-invoked the backend (took {elapsed:?})");

    let calls = std::fs::read_to_string(&counter_path).unwrap_or_default();
    assert_eq!(calls.lines().count(), 1, "exactly one request should have reached the backend");
    let _ = std::fs::remove_file(&counter_path);
}

#[tokio::test]
async fn hourly_cap_breach_auto_suspends_the_key() {
    let mut config = base_config("capbreach");
    config.hourly_call_cap = 1;
    config.breach_action_suspend = true;
    let harness = build(config);
    let key = harness.key_store.create_key(CreateKeyParams { credits: 100, ..Default::default() }).unwrap();

    let body = tool_call_body("echo");
    let first = harness.dispatcher.handle(&HeaderMap::new(), None, None, &key.id, None, &body).await.unwrap();
    assert!(first.response.error.is_none(), "first call is within the hourly cap");

    let second = harness.dispatcher.handle(&HeaderMap::new(), None, None, &key.id, None, &body).await.unwrap();
    let error = second.response.error.unwrap();
    assert!(error.message.contains("hourly_call_cap"));
    assert!(harness.key_store.get_key_raw(&key.id).unwrap().suspended, "breaching the hourly cap must auto-suspend the key");

    let third = harness.dispatcher.handle(&HeaderMap::new(), None, None, &key.id, None, &body).await.unwrap();
    assert!(third.response.error.unwrap().message.contains("api_key_suspended"), "a suspended key is denied on lifecycle, not the cap again");
}

#[tokio::test]
async fn free_method_still_requires_a_usable_key() {
    let harness = build(base_config("free"));
    let key = harness.key_store.create_key(CreateKeyParams::default()).unwrap();
    harness.key_store.revoke(&key.id);

    let body = serde_json::to_vec(&serde_json::json!({
        "jsonrpc": "2.0",
        "method": "ping",
        "params": {},
        "id": 1,
    }))
    .unwrap();

    let outcome = harness.dispatcher.handle(&HeaderMap::new(), None, None, &key.id, None, &body).await.unwrap();
    assert!(outcome.response.error.unwrap().message.contains("invalid_api_key"));
}
