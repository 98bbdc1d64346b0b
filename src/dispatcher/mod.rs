//! Per-request pipeline tying Gate, Proxy, ResponseCache, UsageMeter, and
//! WebhookQueue into the fixed eight-step sequence of §4.16: pre-body size
//! check, envelope parse, IP resolution, admission, cache lookup, backend
//! forward, usage/webhook recording, reply. Grounded in the teacher's
//! `ClaudeAIService`-calling handlers for the request/response shape, and in
//! `middleware` for the pre-body size check idiom.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{jsonrpc_code, AppError};
use crate::gate::{Gate, ToolCall};
use crate::jsonrpc::{is_free_method, JsonRpcRequest, JsonRpcResponse, ToolCallParams};
use crate::models::UsageEvent;
use crate::proxy::{Proxy, ProxyError, RawCallRequest, ToolCallRequest};
use crate::services::response_cache::{CacheLookup, ResponseCache};
use crate::services::usage_meter::UsageMeter;
use crate::services::webhook_queue::{EnqueueParams, WebhookQueue};

/// A registered webhook subscription. Management (admin CRUD) is out of
/// core scope; `set_webhook_filters` is the seam the admin surface calls.
#[derive(Debug, Clone)]
pub struct WebhookFilter {
    pub url: String,
    /// `"call"`, `"deny"`, or `"*"`.
    pub event_type: String,
    pub key_prefix: Option<String>,
    pub max_attempts: u32,
}

pub struct DispatchOutcome {
    pub response: JsonRpcResponse,
    pub request_id: String,
}

pub struct Dispatcher {
    config: Arc<AppConfig>,
    gate: Arc<Gate>,
    proxy: Arc<Proxy>,
    cache: Arc<ResponseCache>,
    usage_meter: Arc<UsageMeter>,
    webhook_queue: Arc<WebhookQueue>,
    webhook_filters: RwLock<Vec<WebhookFilter>>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<AppConfig>,
        gate: Arc<Gate>,
        proxy: Arc<Proxy>,
        cache: Arc<ResponseCache>,
        usage_meter: Arc<UsageMeter>,
        webhook_queue: Arc<WebhookQueue>,
    ) -> Self {
        Self { config, gate, proxy, cache, usage_meter, webhook_queue, webhook_filters: RwLock::new(Vec::new()) }
    }

    pub async fn set_webhook_filters(&self, filters: Vec<WebhookFilter>) {
        *self.webhook_filters.write().await = filters;
    }

    /// Handles one `POST /mcp` request. `content_length` is the declared
    /// size from the HTTP header (step 1 runs before the body is read by the
    /// caller, so this takes the declared length rather than `body.len()`).
    pub async fn handle(
        &self,
        headers: &HeaderMap,
        peer: Option<IpAddr>,
        content_length: Option<usize>,
        api_key_id: &str,
        signature_header: Option<&str>,
        body: &[u8],
    ) -> Result<DispatchOutcome, AppError> {
        let request_id_hex = hex::encode(Uuid::new_v4().as_bytes());
        let request_id = format!("req_{}", &request_id_hex[..16]);

        // Step 1: pre-body size check.
        if content_length.unwrap_or(body.len()) > self.config.max_request_body_bytes {
            return Err(AppError::PayloadTooLarge);
        }

        // Step 2: parse the envelope; malformed requests get a well-formed
        // JSON-RPC error rather than an HTTP failure.
        let req: JsonRpcRequest = match serde_json::from_slice(body) {
            Ok(req) => req,
            Err(e) => {
                return Ok(DispatchOutcome {
                    response: JsonRpcResponse::error(Value::Null, jsonrpc_code::PARSE_ERROR, format!("parse error: {e}")),
                    request_id,
                });
            }
        };
        let id = req.id.clone().unwrap_or(Value::Null);

        // Step 3: resolve client IP.
        let client_ip = self.gate.ip_access_controller.resolve_client_ip(headers, peer);
        let country = headers
            .get(self.config.country_header_name.as_str())
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if is_free_method(&req.method, &self.config.free_methods) {
            return Ok(self.handle_free_method(&req, id, &request_id, api_key_id, &client_ip).await);
        }

        if req.method != "tools/call" {
            return Ok(DispatchOutcome {
                response: JsonRpcResponse::error(id, jsonrpc_code::METHOD_NOT_FOUND, format!("method not found: {}", req.method)),
                request_id,
            });
        }

        let params: ToolCallParams = match serde_json::from_value(req.params.clone()) {
            Ok(p) => p,
            Err(e) => {
                return Ok(DispatchOutcome {
                    response: JsonRpcResponse::error(id, jsonrpc_code::INVALID_PARAMS, format!("invalid params: {e}")),
                    request_id,
                });
            }
        };

        let tool_call = ToolCall { tool: params.name.clone(), arguments: params.arguments.clone() };

        // Step 4: admission.
        let decision = self
            .gate
            .evaluate(
                api_key_id,
                &client_ip,
                signature_header,
                "POST",
                "/mcp",
                body,
                country.as_deref(),
                &tool_call,
            )
            .await;

        if !decision.allowed {
            let reason = decision.reason.unwrap_or(crate::error::DenyReason::InvalidApiKey);
            self.record_and_enqueue(&decision.key_prefix, None, &params.name, 0, false, Some(reason.as_token()), 0, &decision.namespace, &request_id);
            return Ok(DispatchOutcome {
                response: JsonRpcResponse::error_with_data(
                    id,
                    jsonrpc_code::PAYMENT_REQUIRED,
                    format!("Payment required: {reason}"),
                    serde_json::json!({ "reason": reason.as_token() }),
                ),
                request_id,
            });
        }

        let key = self.gate.key_store.get_key_raw(api_key_id);
        let policy = key.as_ref().map(|k| self.gate.key_group_manager.resolve_policy(k));
        let cache_ttl = policy
            .as_ref()
            .and_then(|p| p.tool_pricing.get(&params.name).map(|t| t.cache_ttl_seconds))
            .unwrap_or(self.config.default_cache_ttl_seconds);
        let key_name = key.as_ref().and_then(|k| k.alias.clone());

        // Shadow mode records the original would-be denial on the usage
        // event even though the call is actually let through (§8 scenario 3):
        // `allowed=false` with the original reason, zero credits charged.
        let (event_allowed, event_deny_reason) = match &decision.reason {
            Some(reason) if decision.shadow_reason.is_some() => (false, Some(reason.as_token())),
            _ => (true, None),
        };

        // Step 5: cache lookup (skipped for shadow-mode allows — nothing was
        // actually charged, so nothing should be served stale either). A
        // miss claims the slot single-flight-style; the guard is carried
        // across the backend call below and resolved by populate/abandon.
        let cacheable = cache_ttl > 0 && decision.shadow_reason.is_none();
        let started = Utc::now();
        let mut guard = None;

        if cacheable {
            let cache_key = ResponseCache::key_for(&params.name, &params.arguments);
            match self.cache.lookup(&cache_key).await {
                CacheLookup::Hit(result) => {
                    crate::middleware::metrics::record_cache_hit(&params.name);
                    self.record_and_enqueue(
                        &decision.key_prefix,
                        key_name.clone(),
                        &params.name,
                        decision.credits_charged,
                        event_allowed,
                        event_deny_reason,
                        (Utc::now() - started).num_milliseconds().max(0) as u64,
                        &decision.namespace,
                        &request_id,
                    );
                    return Ok(DispatchOutcome { response: JsonRpcResponse::success(id, result), request_id });
                }
                CacheLookup::Miss(in_flight) => guard = Some(in_flight),
            }
        }

        // Step 6: forward to the backend under the per-tool timeout.
        let call = ToolCallRequest { tool: &params.name, arguments: &params.arguments };
        let timeout = Duration::from_millis(self.config.tool_timeout_ms);
        let outcome = self.proxy.forward(&call, timeout).await;

        match outcome {
            Ok(result) => {
                self.gate.circuit_breaker.record_success(&params.name);
                crate::middleware::metrics::record_circuit_state(&params.name, self.gate.circuit_breaker.state_value(&params.name));
                let surcharge = policy
                    .as_ref()
                    .map(|p| self.gate.apply_output_surcharge(api_key_id, p, &params.name, result_len(&result)))
                    .unwrap_or(0);

                if let Some(guard) = guard {
                    self.cache.populate(guard, result.clone(), cache_ttl);
                }

                self.record_and_enqueue(
                    &decision.key_prefix,
                    key_name.clone(),
                    &params.name,
                    decision.credits_charged + surcharge,
                    event_allowed,
                    event_deny_reason,
                    (Utc::now() - started).num_milliseconds().max(0) as u64,
                    &decision.namespace,
                    &request_id,
                );
                Ok(DispatchOutcome { response: JsonRpcResponse::success(id, result), request_id })
            }
            Err(err) => {
                self.gate.circuit_breaker.record_failure(&params.name, Utc::now());
                crate::middleware::metrics::record_circuit_state(&params.name, self.gate.circuit_breaker.state_value(&params.name));
                self.gate.settle_failure(api_key_id, decision.credits_charged, Utc::now()).await;
                if let Some(guard) = guard {
                    self.cache.abandon(guard);
                }

                let reason = match &err {
                    ProxyError::Timeout => crate::error::DenyReason::BackendTimeout,
                    _ => crate::error::DenyReason::BackendError,
                };
                self.record_and_enqueue(
                    &decision.key_prefix,
                    key_name,
                    &params.name,
                    0,
                    false,
                    Some(reason.as_token()),
                    (Utc::now() - started).num_milliseconds().max(0) as u64,
                    &decision.namespace,
                    &request_id,
                );

                let code = match &err {
                    ProxyError::BackendError { code, .. } => *code,
                    _ => jsonrpc_code::INTERNAL_ERROR,
                };
                Ok(DispatchOutcome { response: JsonRpcResponse::error(id, code, err.to_string()), request_id })
            }
        }
    }

    /// Free methods skip pricing/quota/rate-limit/spend entirely, but they
    /// still need a usable key (authentication is not a billing concern) and
    /// still traverse IP access and the circuit breaker (§6).
    async fn handle_free_method(
        &self,
        req: &JsonRpcRequest,
        id: Value,
        request_id: &str,
        api_key_id: &str,
        client_ip: &str,
    ) -> DispatchOutcome {
        let now = Utc::now();
        match self.gate.key_store.get_key_raw(api_key_id) {
            Some(key) if key.is_usable(now) => {}
            _ => {
                return DispatchOutcome {
                    response: JsonRpcResponse::error(
                        id,
                        jsonrpc_code::PAYMENT_REQUIRED,
                        format!("Payment required: {}", crate::error::DenyReason::InvalidApiKey),
                    ),
                    request_id: request_id.to_string(),
                };
            }
        }

        if let Err(reason) = self.gate.circuit_breaker.check(&req.method, now) {
            return DispatchOutcome {
                response: JsonRpcResponse::error(id, jsonrpc_code::PAYMENT_REQUIRED, format!("Payment required: {reason}")),
                request_id: request_id.to_string(),
            };
        }
        if let Err(reason) = self.gate.ip_access_controller.check(client_ip, None) {
            return DispatchOutcome {
                response: JsonRpcResponse::error(id, jsonrpc_code::PAYMENT_REQUIRED, format!("Payment required: {reason}")),
                request_id: request_id.to_string(),
            };
        }

        let timeout = Duration::from_millis(self.config.tool_timeout_ms);
        let call = RawCallRequest { method: &req.method, params: &req.params };
        match self.proxy.forward_raw(&call, timeout).await {
            Ok(result) => {
                self.gate.circuit_breaker.record_success(&req.method);
                self.record_and_enqueue(
                    "free",
                    None,
                    &req.method,
                    0,
                    true,
                    None,
                    0,
                    "default",
                    request_id,
                );
                DispatchOutcome { response: JsonRpcResponse::success(id, result), request_id: request_id.to_string() }
            }
            Err(err) => {
                self.gate.circuit_breaker.record_failure(&req.method, Utc::now());
                let code = match &err {
                    ProxyError::BackendError { code, .. } => *code,
                    _ => jsonrpc_code::INTERNAL_ERROR,
                };
                DispatchOutcome { response: JsonRpcResponse::error(id, code, err.to_string()), request_id: request_id.to_string() }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_and_enqueue(
        &self,
        key_prefix: &str,
        key_name: Option<String>,
        tool: &str,
        credits_charged: u64,
        allowed: bool,
        deny_reason: Option<&str>,
        duration_ms: u64,
        namespace: &str,
        request_id: &str,
    ) {
        if let Some(reason) = deny_reason {
            crate::middleware::metrics::record_gate_denial(reason);
        }
        if credits_charged > 0 {
            crate::middleware::metrics::record_credits_charged(tool, credits_charged);
        }

        let event = UsageEvent {
            timestamp: Utc::now(),
            key_prefix: key_prefix.to_string(),
            key_name,
            tool: tool.to_string(),
            credits_charged,
            allowed,
            deny_reason: deny_reason.map(|s| s.to_string()),
            duration_ms,
            namespace: namespace.to_string(),
            request_id: Some(request_id.to_string()),
        };
        self.maybe_enqueue_webhooks(&event);
        self.usage_meter.record(event);
    }

    fn maybe_enqueue_webhooks(&self, event: &UsageEvent) {
        let event_type = if event.allowed { "call" } else { "deny" };
        let filters = match self.webhook_filters.try_read() {
            Ok(f) => f,
            Err(_) => return,
        };
        for filter in filters.iter() {
            let type_matches = filter.event_type == "*" || filter.event_type == event_type;
            let prefix_matches = filter.key_prefix.as_deref().map(|p| event.key_prefix.starts_with(p)).unwrap_or(true);
            if type_matches && prefix_matches {
                self.webhook_queue.enqueue(EnqueueParams {
                    url: filter.url.clone(),
                    payload: serde_json::to_value(event).unwrap_or(Value::Null),
                    max_attempts: filter.max_attempts,
                });
            }
        }
    }
}

fn result_len(value: &Value) -> usize {
    serde_json::to_vec(value).map(|b| b.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendTransportConfig;
    use crate::services::audit_log::AuditLog;
    use crate::services::circuit_breaker::CircuitBreaker;
    use crate::services::ip_access_controller::IpAccessController;
    use crate::services::key_group_manager::KeyGroupManager;
    use crate::services::key_store::{CreateKeyParams, KeyStore};
    use crate::services::quota_tracker::QuotaTracker;
    use crate::services::rate_limiter::RateLimiter;
    use crate::services::request_signer::RequestSigner;
    use crate::services::spend_cap_manager::SpendCapManager;
    use std::time::Duration as StdDuration;

    fn make_config() -> Arc<AppConfig> {
        Arc::new(AppConfig {
            bind_addr: "0.0.0.0:0".into(),
            admin_key: "test".into(),
            state_file_path: std::env::temp_dir()
                .join(format!("paygate-dispatch-test-{}.json", uuid::Uuid::new_v4()))
                .to_string_lossy()
                .to_string(),
            snapshot_flush_interval: StdDuration::from_secs(30),
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
        })
    }

    fn make_dispatcher(config: Arc<AppConfig>) -> (Dispatcher, Arc<KeyStore>) {
        let key_store = Arc::new(KeyStore::load(config.state_file_path.clone()));
        let gate = Arc::new(Gate::new(
            config.clone(),
            key_store.clone(),
            Arc::new(RateLimiter::new()),
            Arc::new(QuotaTracker::new(Default::default())),
            Arc::new(SpendCapManager::new(0, 0, 0, 0, true, 0)),
            Arc::new(IpAccessController::new(false, vec![], vec![], 10, 60_000, 0)),
            Arc::new(RequestSigner::new(false, 300_000, 300_000, 1000)),
            Arc::new(KeyGroupManager::new()),
            Arc::new(CircuitBreaker::new(5, 30)),
            Arc::new(AuditLog::new(1000)),
        ));
        let proxy = Arc::new(Proxy::spawn(&config.backend).unwrap());
        let dispatcher = Dispatcher::new(
            config.clone(),
            gate,
            proxy,
            Arc::new(ResponseCache::new(config.response_cache_cap)),
            Arc::new(UsageMeter::new(config.usage_event_retention)),
            Arc::new(WebhookQueue::new(100)),
        );
        (dispatcher, key_store)
    }

    #[tokio::test]
    async fn tools_call_success_charges_and_records_usage() {
        let config = make_config();
        let (dispatcher, key_store) = make_dispatcher(config);
        let key = key_store.create_key(CreateKeyParams { credits: 100, ..Default::default() }).unwrap();

        let body = serde_json::to_vec(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": "tools/call",
            "params": { "name": "echo", "arguments": {} },
            "id": 1,
        }))
        .unwrap();

        let outcome = dispatcher
            .handle(&HeaderMap::new(), None, None, &key.id, None, &body)
            .await
            .unwrap();

        assert!(outcome.response.error.is_none());
        assert_eq!(key_store.get_key_raw(&key.id).unwrap().credits, 95);
    }

    #[tokio::test]
    async fn tools_call_denied_emits_payment_required() {
        let config = make_config();
        let (dispatcher, key_store) = make_dispatcher(config);
        let key = key_store.create_key(CreateKeyParams { credits: 2, ..Default::default() }).unwrap();

        let body = serde_json::to_vec(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": "tools/call",
            "params": { "name": "echo", "arguments": {} },
            "id": 1,
        }))
        .unwrap();

        let outcome = dispatcher
            .handle(&HeaderMap::new(), None, None, &key.id, None, &body)
            .await
            .unwrap();

        let error = outcome.response.error.unwrap();
        assert_eq!(error.code, jsonrpc_code::PAYMENT_REQUIRED);
        assert!(error.message.contains("insufficient_credits"));
    }

    #[tokio::test]
    async fn free_method_bypasses_billing() {
        let config = make_config();
        let (dispatcher, key_store) = make_dispatcher(config);
        let key = key_store.create_key(CreateKeyParams { credits: 0, ..Default::default() }).unwrap();

        let body = serde_json::to_vec(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": "ping",
            "params": {},
            "id": 1,
        }))
        .unwrap();

        let outcome = dispatcher
            .handle(&HeaderMap::new(), None, None, &key.id, None, &body)
            .await
            .unwrap();

        assert!(outcome.response.error.is_none());
        assert_eq!(key_store.get_key_raw(&key.id).unwrap().credits, 0);
    }

    #[tokio::test]
    async fn oversized_body_rejected_before_parsing() {
        let mut config = (*make_config()).clone();
        config.max_request_body_bytes = 10;
        let config = Arc::new(config);
        let (dispatcher, key_store) = make_dispatcher(config);
        let key = key_store.create_key(CreateKeyParams { credits: 100, ..Default::default() }).unwrap();

        let body = vec![b'x'; 1024];
        let err = dispatcher
            .handle(&HeaderMap::new(), None, Some(1024), &key.id, None, &body)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PayloadTooLarge));
    }

    #[tokio::test]
    async fn malformed_json_gets_parse_error_not_http_failure() {
        let config = make_config();
        let (dispatcher, key_store) = make_dispatcher(config);
        let key = key_store.create_key(CreateKeyParams { credits: 100, ..Default::default() }).unwrap();

        let outcome = dispatcher
            .handle(&HeaderMap::new(), None, None, &key.id, None, b"not json")
            .await
            .unwrap();

        let error = outcome.response.error.unwrap();
        assert_eq!(error.code, jsonrpc_code::PARSE_ERROR);
    }
}
