//! Policy templates inherited by member keys, and the deterministic merge
//! rules of §4.7. A key holds only the group's identifier (no cyclic
//! references, per §9); group deletion detaches members lazily on lookup.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;

use crate::models::{ApiKey, EffectivePolicy, KeyGroup};

pub struct KeyGroupManager {
    groups: Arc<DashMap<String, KeyGroup>>,
}

impl KeyGroupManager {
    pub fn new() -> Self {
        Self { groups: Arc::new(DashMap::new()) }
    }

    pub fn load(groups: Vec<KeyGroup>) -> Self {
        let map = DashMap::new();
        for g in groups {
            map.insert(g.id.clone(), g);
        }
        Self { groups: Arc::new(map) }
    }

    pub fn create_group(&self, group: KeyGroup) {
        self.groups.insert(group.id.clone(), group);
    }

    pub fn get(&self, id: &str) -> Option<KeyGroup> {
        self.groups.get(id).map(|g| g.clone())
    }

    /// Group deletion detaches members lazily: the key still references the
    /// old id, but lookups return `None` and `resolve_policy` falls back to
    /// the key's own values.
    pub fn delete_group(&self, id: &str) {
        self.groups.remove(id);
    }

    pub fn list(&self) -> Vec<KeyGroup> {
        self.groups.iter().map(|g| g.clone()).collect()
    }

    /// Resolves the effective per-call policy for a key, per the merge
    /// table in §4.7. A key without a group uses only its own values.
    pub fn resolve_policy(&self, key: &ApiKey) -> EffectivePolicy {
        let group = key.group_id.as_ref().and_then(|id| self.get(id));

        let Some(group) = group else {
            return EffectivePolicy {
                allowed_tools: key.allowed_tools.clone(),
                denied_tools: key.denied_tools.clone(),
                rate_limit_per_min: key.rate_limit_per_min,
                quota: key.quota.clone(),
                ip_allowlist: key.ip_allowlist.clone(),
                tool_pricing: key.tool_pricing.clone(),
                max_spending_limit: key.spending_limit,
            };
        };

        // allowedTools: key-level wins iff non-empty; else group.
        let allowed_tools = if !key.allowed_tools.is_empty() { key.allowed_tools.clone() } else { group.allowed_tools.clone() };

        // deniedTools: union of group and key.
        let denied_tools: HashSet<String> = group.denied_tools.union(&key.denied_tools).cloned().collect();

        // rateLimitPerMin: group value (0 = use server global).
        let rate_limit_per_min = if group.rate_limit_per_min != 0 { Some(group.rate_limit_per_min) } else { key.rate_limit_per_min };

        // quota: key-level wins iff present; else group.
        let quota = key.quota.clone().or_else(|| group.quota.clone());

        // ipAllowlist: union of group and key.
        let ip_allowlist: HashSet<String> = group.ip_allowlist.union(&key.ip_allowlist).cloned().collect();

        // toolPricing: group overrides are the effective base.
        let mut tool_pricing = group.tool_pricing.clone();
        for (tool, pricing) in &key.tool_pricing {
            tool_pricing.insert(tool.clone(), *pricing);
        }

        // maxSpendingLimit: group cap is authoritative when set.
        let max_spending_limit = if group.max_spending_limit != 0 { group.max_spending_limit } else { key.spending_limit };

        EffectivePolicy { allowed_tools, denied_tools, rate_limit_per_min, quota, ip_allowlist, tool_pricing, max_spending_limit }
    }
}

impl Default for KeyGroupManager {
    fn default() -> Self {
        Self::new()
    }
}
