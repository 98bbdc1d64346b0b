//! Gate — orchestrates every admission sub-check into one evaluate→charge→
//! settle pipeline (§4.12). Credit reservation is the single serializable
//! commit point (§5): no other component's decision is binding until
//! credits are deducted via `KeyStore::charge`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::AppConfig;
use crate::error::DenyReason;
use crate::models::ApiKey;
use crate::services::audit_log::AuditLog;
use crate::services::circuit_breaker::CircuitBreaker;
use crate::services::ip_access_controller::IpAccessController;
use crate::services::key_group_manager::KeyGroupManager;
use crate::services::key_store::KeyStore;
use crate::services::quota_tracker::QuotaTracker;
use crate::services::rate_limiter::RateLimiter;
use crate::services::request_signer::RequestSigner;
use crate::services::spend_cap_manager::SpendCapManager;

pub struct ToolCall {
    pub tool: String,
    pub arguments: Value,
}

#[derive(Debug, Clone)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
    /// Present for any deny under shadow mode: `shadow:<original-reason>`.
    pub shadow_reason: Option<String>,
    pub credits_charged: u64,
    pub remaining_credits: u64,
    pub key_prefix: String,
    pub namespace: String,
}

pub struct Gate {
    config: Arc<AppConfig>,
    pub key_store: Arc<KeyStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub quota_tracker: Arc<QuotaTracker>,
    pub spend_cap_manager: Arc<SpendCapManager>,
    pub ip_access_controller: Arc<IpAccessController>,
    pub request_signer: Arc<RequestSigner>,
    pub key_group_manager: Arc<KeyGroupManager>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub audit_log: Arc<AuditLog>,
}

impl Gate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<AppConfig>,
        key_store: Arc<KeyStore>,
        rate_limiter: Arc<RateLimiter>,
        quota_tracker: Arc<QuotaTracker>,
        spend_cap_manager: Arc<SpendCapManager>,
        ip_access_controller: Arc<IpAccessController>,
        request_signer: Arc<RequestSigner>,
        key_group_manager: Arc<KeyGroupManager>,
        circuit_breaker: Arc<CircuitBreaker>,
        audit_log: Arc<AuditLog>,
    ) -> Self {
        Self {
            config,
            key_store,
            rate_limiter,
            quota_tracker,
            spend_cap_manager,
            ip_access_controller,
            request_signer,
            key_group_manager,
            circuit_breaker,
            audit_log,
        }
    }

    /// Fixed-order evaluation (§4.12). Short-circuits on the first denial.
    pub async fn evaluate(
        &self,
        api_key_id: &str,
        client_ip: &str,
        signature_header: Option<&str>,
        method: &str,
        path: &str,
        body: &[u8],
        country: Option<&str>,
        tool_call: &ToolCall,
    ) -> GateDecision {
        let now = Utc::now();

        match self.evaluate_inner(api_key_id, client_ip, signature_header, method, path, body, country, tool_call, now).await {
            Ok(decision) => decision,
            Err(reason) => self.deny(reason, api_key_id, now),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn evaluate_inner(
        &self,
        api_key_id: &str,
        client_ip: &str,
        signature_header: Option<&str>,
        method: &str,
        path: &str,
        body: &[u8],
        country: Option<&str>,
        tool_call: &ToolCall,
        now: DateTime<Utc>,
    ) -> Result<GateDecision, DenyReason> {
        // Step 2: key lookup happens before signature verification can be
        // resolved (we need the registered secret), but the deny reason for
        // an absent key takes priority only once we know whether a secret
        // exists. We look the key up raw first purely to fetch its secret;
        // lifecycle/admission decisions below still run in spec order.
        let key = self.key_store.get_key_raw(api_key_id);

        // Step 1: signature verify (if signing enabled for this key).
        if let Some(key) = &key {
            if let Some(header) = signature_header {
                let secret = self.signing_secret_for(key);
                self.request_signer
                    .verify(secret.as_deref(), header, method, path, body, now)
                    .map_err(|e| match e {
                        crate::services::request_signer::SignatureError::Expired => DenyReason::SignatureExpired,
                        crate::services::request_signer::SignatureError::Replayed => DenyReason::NonceReplayed,
                        _ => DenyReason::SignatureInvalid,
                    })?;
            }
        }

        // Step 2: key lookup.
        let key = key.ok_or(DenyReason::InvalidApiKey)?;

        // Step 3: lifecycle.
        if key.revoked {
            return Err(DenyReason::ApiKeyRevoked);
        }
        if key.is_expired(now) {
            return Err(DenyReason::ApiKeyExpired);
        }
        if key.suspended {
            // An auto-suspended key clears itself once its cooldown has
            // elapsed (§4.4); a manually-suspended key (`auto_suspended_at`
            // unset) is never auto-resumed.
            if !self.spend_cap_manager.maybe_auto_resume(&self.key_store, &key.id, now) {
                return Err(DenyReason::ApiKeySuspended);
            }
        }

        // Step 4: IP access.
        let policy = self.key_group_manager.resolve_policy(&key);
        self.ip_access_controller.check(client_ip, Some(&policy.ip_allowlist))?;

        // Step 5: tool ACL (allow-list first, then deny-list union).
        if !policy.allowed_tools.is_empty() && !policy.allowed_tools.contains(&tool_call.tool) {
            return Err(DenyReason::ToolNotAllowed);
        }
        if policy.denied_tools.contains(&tool_call.tool) {
            return Err(DenyReason::ToolDenied);
        }

        // Step 6: country ACL.
        if let Some(country) = country {
            if key.country_deny.contains(country) {
                return Err(DenyReason::CountryBlocked);
            }
            if !key.country_allow.is_empty() && !key.country_allow.contains(country) {
                return Err(DenyReason::CountryBlocked);
            }
        }

        // Step 7: circuit breaker.
        self.circuit_breaker.check(&tool_call.tool, now)?;

        // Pricing (§4.12): creditsRequired = max(1, base) + ceil(inputKb) * perKbInput.
        let credits_required = self.price(&policy, &tool_call.tool, &tool_call.arguments);

        // Step 8: server spend cap.
        if let Err(reason) = self.spend_cap_manager.check_server_cap(credits_required, now).await {
            self.on_spend_cap_breach(&key, now);
            return Err(reason);
        }

        // Step 9: per-key hourly cap.
        if let Err(reason) = self.spend_cap_manager.check_hourly_cap(&key.id, credits_required, now) {
            self.on_spend_cap_breach(&key, now);
            return Err(reason);
        }

        // Step 10: quotas.
        self.quota_tracker.check(&self.key_store, &key, policy.quota.as_ref(), credits_required, now)?;

        // Step 11: rate limit, global then per-tool. A tool carries its own
        // window only when it has an explicit pricing entry (the caller-
        // supplied "configured" signal from §4.2); it shares the same cap
        // as the key's global limit but on its own composite-key window.
        let rate_limit = policy.rate_limit_per_min.unwrap_or(self.config.global_rate_limit_per_min);
        if !self.rate_limiter.check(&key.id, rate_limit).allowed {
            return Err(DenyReason::RateLimited);
        }
        let per_tool_key = policy
            .tool_pricing
            .contains_key(&tool_call.tool)
            .then(|| RateLimiter::composite_key(&key.id, &tool_call.tool));
        if let Some(composite) = &per_tool_key {
            if !self.rate_limiter.check(composite, rate_limit).allowed {
                return Err(DenyReason::RateLimited);
            }
        }

        // Step 12: credits.
        if !self.key_store.has_credits(&key.id, credits_required) {
            return Err(DenyReason::InsufficientCredits);
        }

        // Step 13: spending limit (0 = unlimited).
        if policy.max_spending_limit != 0 && key.total_spent + credits_required > policy.max_spending_limit {
            return Err(DenyReason::SpendingLimitExceeded);
        }

        // Admission: reserve credits atomically (charge-then-record is the
        // single serializable commit point, §5).
        let charged = match self.key_store.charge(&key.id, credits_required) {
            Ok(charged) => charged,
            Err(_) => return Err(DenyReason::InsufficientCredits),
        };

        self.quota_tracker.record(&self.key_store, &key.id, credits_required);
        self.spend_cap_manager.record(&key.id, credits_required, now).await;
        self.rate_limiter.record(&key.id);
        if let Some(composite) = &per_tool_key {
            self.rate_limiter.record(composite);
        }

        Ok(GateDecision {
            allowed: true,
            reason: None,
            shadow_reason: None,
            credits_charged: credits_required,
            remaining_credits: charged.credits,
            key_prefix: charged.masked_prefix(),
            namespace: charged.namespace,
        })
    }

    fn deny(&self, reason: DenyReason, api_key_id: &str, now: DateTime<Utc>) -> GateDecision {
        let key = self.key_store.get_key_raw(api_key_id);
        let (key_prefix, namespace) = key
            .map(|k| (k.masked_prefix(), k.namespace))
            .unwrap_or_else(|| (mask_raw_id(api_key_id), "default".to_string()));

        // Shadow mode: deny becomes allow with `shadow:<reason>`, zero
        // credits charged, event recorded with the original outcome.
        if self.config.shadow_mode {
            return GateDecision {
                allowed: true,
                reason: Some(reason),
                shadow_reason: Some(format!("shadow:{reason}")),
                credits_charged: 0,
                remaining_credits: 0,
                key_prefix,
                namespace,
            };
        }

        let _ = now;
        GateDecision {
            allowed: false,
            reason: Some(reason),
            shadow_reason: None,
            credits_charged: 0,
            remaining_credits: 0,
            key_prefix,
            namespace,
        }
    }

    fn price(&self, policy: &crate::models::EffectivePolicy, tool: &str, arguments: &Value) -> u64 {
        let default_pricing = crate::models::ToolPricing {
            credits_per_call: self.config.default_credits_per_call,
            credits_per_kb_input: self.config.default_credits_per_kb_input,
            credits_per_kb_output: self.config.default_credits_per_kb_output,
            cache_ttl_seconds: self.config.default_cache_ttl_seconds,
        };
        let pricing = policy.tool_pricing.get(tool).copied().unwrap_or(default_pricing);
        let base = pricing.credits_per_call.max(1);
        let input_bytes = serde_json::to_vec(arguments).map(|b| b.len()).unwrap_or(0);
        let input_kb = ((input_bytes as f64) / 1024.0).ceil() as u64;
        base + input_kb * pricing.credits_per_kb_input
    }

    /// Post-call surcharge on success, bounded by remaining credits (§4.12).
    pub fn apply_output_surcharge(&self, key_id: &str, policy: &crate::models::EffectivePolicy, tool: &str, output_bytes: usize) -> u64 {
        let default_per_kb_output = self.config.default_credits_per_kb_output;
        let per_kb_output = policy.tool_pricing.get(tool).map(|p| p.credits_per_kb_output).unwrap_or(default_per_kb_output);
        if per_kb_output == 0 {
            return 0;
        }
        let output_kb = ((output_bytes as f64) / 1024.0).ceil() as u64;
        let surcharge = output_kb * per_kb_output;
        self.key_store.charge_bounded(key_id, surcharge).map(|(charged, _)| charged).unwrap_or(0)
    }

    /// On backend failure with `refundOnFailure`, refunds the base
    /// reservation and rolls back quota/cap counters. Per the open-question
    /// decision in SPEC_FULL.md, only the base reservation is refunded —
    /// the output surcharge is applied only on confirmed success so there
    /// is nothing to refund for it.
    pub async fn settle_failure(&self, key_id: &str, credits_charged: u64, now: DateTime<Utc>) {
        if !self.config.refund_on_failure || credits_charged == 0 {
            return;
        }
        self.key_store.refund(key_id, credits_charged);
        self.quota_tracker.unrecord(&self.key_store, key_id, credits_charged);
        let _ = now;
    }

    /// Decodes the key's registered HMAC secret (§4.6), if any. Secrets are
    /// minted by the admin surface via `RequestSigner::generate_secret` and
    /// stored hex-encoded on the key record; absence means signing is
    /// opt-in-but-unregistered for this key (the verify step admits).
    fn signing_secret_for(&self, key: &ApiKey) -> Option<Vec<u8>> {
        key.signing_secret.as_deref().and_then(|hex_secret| hex::decode(hex_secret).ok())
    }

    /// On a server-wide or per-key cap breach, consults
    /// `breach_action_suspend` via `SpendCapManager::on_breach` and audits
    /// the suspension if it fired (§4.4).
    fn on_spend_cap_breach(&self, key: &ApiKey, now: DateTime<Utc>) {
        if self.spend_cap_manager.on_breach(&self.key_store, &key.id, now) {
            self.audit_log.log_key_suspended(&key.masked_prefix(), "spend_cap_breach");
        }
    }
}

fn mask_raw_id(id: &str) -> String {
    let n = id.len().min(10);
    format!("{}...", &id[..n])
}
