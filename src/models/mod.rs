//! Core data model: API keys, key groups, usage events, and the small value
//! types the gate pipeline threads between components.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Independent lifecycle flags plus a computed terminal state.
///
/// `active`/`suspended` are stored independently per spec; `Expired` is never
/// stored, it is derived from `expires_at` at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyLifecycleState {
    Created,
    Active,
    Suspended,
    Revoked,
}

impl Default for KeyLifecycleState {
    fn default() -> Self {
        KeyLifecycleState::Created
    }
}

/// Auto-topup configuration, nil-able sub-config per the key record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoTopup {
    pub enabled: bool,
    pub threshold_credits: u64,
    pub topup_credits: u64,
}

/// Per-key quota override; absence means "use the group or global default".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub daily_call_limit: u64,
    pub monthly_call_limit: u64,
    pub daily_credit_limit: u64,
    pub monthly_credit_limit: u64,
}

/// Mutable quota counters embedded in the key record (not a separate entity).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaCounters {
    pub daily_calls: u64,
    pub daily_credits: u64,
    pub monthly_calls: u64,
    pub monthly_credits: u64,
    /// `YYYY-MM-DD`, UTC.
    pub last_reset_day: String,
    /// `YYYY-MM`, UTC.
    pub last_reset_month: String,
}

/// Per-tool pricing override.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ToolPricing {
    pub credits_per_call: u64,
    pub credits_per_kb_input: u64,
    pub credits_per_kb_output: u64,
    pub cache_ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    /// `pg_` + random hex, >=128 bits entropy.
    pub id: String,
    pub alias: Option<String>,
    pub credits: u64,
    pub total_spent: u64,
    pub total_calls: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub suspended: bool,
    pub auto_suspended_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// 0 = unlimited.
    pub spending_limit: u64,
    pub allowed_tools: HashSet<String>,
    pub denied_tools: HashSet<String>,
    pub rate_limit_per_min: Option<u64>,
    pub ip_allowlist: HashSet<String>,
    pub quota: Option<QuotaConfig>,
    pub quota_counters: QuotaCounters,
    pub tags: HashMap<String, String>,
    pub group_id: Option<String>,
    pub namespace: String,
    pub country_allow: HashSet<String>,
    pub country_deny: HashSet<String>,
    pub auto_topup: Option<AutoTopup>,
    pub tool_pricing: HashMap<String, ToolPricing>,
    pub revoked: bool,
    /// Hex-encoded HMAC-SHA256 secret for request signing (§4.6). `None`
    /// means signing is unregistered for this key, so the signature step
    /// admits regardless of whether the caller sends a signature header.
    pub signing_secret: Option<String>,
}

impl ApiKey {
    /// `keyPrefix = first 10 chars + "..."`.
    pub fn masked_prefix(&self) -> String {
        let n = self.id.len().min(10);
        format!("{}...", &self.id[..n])
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }

    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.suspended && !self.revoked && !self.is_expired(now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyGroup {
    /// `grp_` + 16 hex chars.
    pub id: String,
    pub name: String,
    pub allowed_tools: HashSet<String>,
    pub denied_tools: HashSet<String>,
    /// 0 = use server global.
    pub rate_limit_per_min: u64,
    pub tool_pricing: HashMap<String, ToolPricing>,
    pub quota: Option<QuotaConfig>,
    pub ip_allowlist: HashSet<String>,
    pub default_credits: u64,
    pub max_spending_limit: u64,
    pub tags: HashMap<String, String>,
}

/// Effective per-call policy, resolved from group defaults + key overrides
/// per §4.7's merge table. Computed fresh on each evaluation; never cached
/// across key/group mutations.
#[derive(Debug, Clone, Default)]
pub struct EffectivePolicy {
    pub allowed_tools: HashSet<String>,
    pub denied_tools: HashSet<String>,
    pub rate_limit_per_min: Option<u64>,
    pub quota: Option<QuotaConfig>,
    pub ip_allowlist: HashSet<String>,
    pub tool_pricing: HashMap<String, ToolPricing>,
    pub max_spending_limit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub timestamp: DateTime<Utc>,
    pub key_prefix: String,
    pub key_name: Option<String>,
    pub tool: String,
    pub credits_charged: u64,
    pub allowed: bool,
    pub deny_reason: Option<String>,
    pub duration_ms: u64,
    pub namespace: String,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistedState {
    pub keys: Vec<ApiKey>,
    pub groups: Vec<KeyGroup>,
}
