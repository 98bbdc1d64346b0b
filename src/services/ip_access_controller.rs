//! Global allow/deny with CIDR, per-key IP bindings, auto-block on repeated
//! violations (§4.5). The DashMap-plus-sweep idiom is grounded in the
//! teacher's `TokenBlacklistService`; CIDR parsing is hand-rolled per spec.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::DenyReason;

const VIOLATION_WINDOW_SECS: i64 = 3600;
const VIOLATIONS_CAP: usize = 50_000;
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct AutoBlock {
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Violation {
    first_seen: DateTime<Utc>,
    count: u64,
}

pub struct IpAccessController {
    enabled: bool,
    global_allowlist: Vec<String>,
    global_denylist: Vec<String>,
    auto_block_threshold: u64,
    auto_block_duration_ms: i64,
    trusted_proxy_depth: u8,

    violations: Arc<DashMap<String, Violation>>,
    auto_blocks: Arc<DashMap<String, AutoBlock>>,
}

impl IpAccessController {
    pub fn new(
        enabled: bool,
        global_allowlist: Vec<String>,
        global_denylist: Vec<String>,
        auto_block_threshold: u64,
        auto_block_duration_ms: i64,
        trusted_proxy_depth: u8,
    ) -> Self {
        let violations: Arc<DashMap<String, Violation>> = Arc::new(DashMap::new());
        let auto_blocks: Arc<DashMap<String, AutoBlock>> = Arc::new(DashMap::new());

        let sweep_violations = violations.clone();
        let sweep_blocks = auto_blocks.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let now = Utc::now();
                sweep_violations.retain(|_, v| (now - v.first_seen).num_seconds() < VIOLATION_WINDOW_SECS);
                sweep_blocks.retain(|_, b| b.expires_at > now);
            }
        });

        Self {
            enabled,
            global_allowlist,
            global_denylist,
            auto_block_threshold,
            auto_block_duration_ms,
            trusted_proxy_depth: trusted_proxy_depth.clamp(0, 10),
            violations,
            auto_blocks,
        }
    }

    /// Resolves the client IP from `X-Forwarded-For` (position `len -
    /// trustedProxyDepth`), falling back to `X-Real-Ip`, then the transport
    /// peer address.
    pub fn resolve_client_ip(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> String {
        if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            let parts: Vec<&str> = xff.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
            if !parts.is_empty() {
                let depth = self.trusted_proxy_depth as usize;
                let idx = parts.len().saturating_sub(1 + depth);
                if let Some(ip) = parts.get(idx) {
                    return ip.to_string();
                }
            }
        }
        if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
            return real_ip.trim().to_string();
        }
        peer.map(|ip| ip.to_string()).unwrap_or_else(|| "unknown".to_string())
    }

    pub fn check(&self, ip: &str, key_allowlist: Option<&std::collections::HashSet<String>>) -> Result<(), DenyReason> {
        if !self.enabled {
            return Ok(());
        }

        let now = Utc::now();
        if let Some(block) = self.auto_blocks.get(ip) {
            if block.expires_at > now {
                return Err(DenyReason::IpBlocked);
            }
        }

        if self.global_denylist.iter().any(|pattern| ip_matches_pattern(ip, pattern)) {
            self.record_violation(ip, now);
            return Err(DenyReason::IpBlocked);
        }

        if !self.global_allowlist.is_empty() && !self.global_allowlist.iter().any(|p| ip_matches_pattern(ip, p)) {
            self.record_violation(ip, now);
            return Err(DenyReason::IpBlocked);
        }

        if let Some(allowlist) = key_allowlist {
            if !allowlist.is_empty() && !allowlist.iter().any(|p| ip_matches_pattern(ip, p)) {
                self.record_violation(ip, now);
                return Err(DenyReason::IpBlocked);
            }
        }

        Ok(())
    }

    fn record_violation(&self, ip: &str, now: DateTime<Utc>) {
        let mut entry = self.violations.entry(ip.to_string()).or_insert_with(|| Violation { first_seen: now, count: 0 });
        if (now - entry.first_seen).num_seconds() >= VIOLATION_WINDOW_SECS {
            entry.first_seen = now;
            entry.count = 0;
        }
        entry.count += 1;
        if entry.count >= self.auto_block_threshold {
            let expires_at = now + chrono::Duration::milliseconds(self.auto_block_duration_ms);
            self.auto_blocks.insert(ip.to_string(), AutoBlock { expires_at });
        }
        drop(entry);
        if self.violations.len() > VIOLATIONS_CAP {
            self.violations.retain(|_, v| (now - v.first_seen).num_seconds() < VIOLATION_WINDOW_SECS);
        }
    }

    pub fn block_manually(&self, ip: &str, duration_ms: i64) {
        let expires_at = Utc::now() + chrono::Duration::milliseconds(duration_ms);
        self.auto_blocks.insert(ip.to_string(), AutoBlock { expires_at });
    }
}

/// CIDR match. IPv4 is parsed as a 32-bit integer; IPv4-mapped-IPv6
/// (`::ffff:a.b.c.d`) is normalized to its IPv4 form. IPv6 CIDR beyond exact
/// match is out of scope.
pub fn ip_matches_pattern(ip: &str, pattern: &str) -> bool {
    let ip = normalize_ip(ip);
    if let Some((network, prefix)) = pattern.split_once('/') {
        let network = normalize_ip(network);
        let Some(prefix_len) = prefix.parse::<u32>().ok() else { return false };
        match (parse_ipv4(&ip), parse_ipv4(&network)) {
            (Some(ip_bits), Some(net_bits)) => {
                if prefix_len > 32 {
                    return false;
                }
                let mask = if prefix_len == 0 { 0 } else { u32::MAX << (32 - prefix_len) };
                (ip_bits & mask) == (net_bits & mask)
            }
            _ => ip == network,
        }
    } else {
        ip == normalize_ip(pattern)
    }
}

fn normalize_ip(ip: &str) -> String {
    let trimmed = ip.trim();
    if let Some(stripped) = trimmed.strip_prefix("::ffff:") {
        return stripped.to_string();
    }
    trimmed.to_string()
}

fn parse_ipv4(ip: &str) -> Option<u32> {
    let octets: Vec<&str> = ip.split('.').collect();
    if octets.len() != 4 {
        return None;
    }
    let mut bits: u32 = 0;
    for octet in octets {
        let value: u32 = octet.parse().ok()?;
        if value > 255 {
            return None;
        }
        bits = (bits << 8) | value;
    }
    Some(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_match_exact() {
        assert!(ip_matches_pattern("10.0.0.5", "10.0.0.5"));
        assert!(!ip_matches_pattern("10.0.0.6", "10.0.0.5"));
    }

    #[test]
    fn cidr_match_subnet() {
        assert!(ip_matches_pattern("10.0.0.5", "10.0.0.0/24"));
        assert!(!ip_matches_pattern("10.0.1.5", "10.0.0.0/24"));
        assert!(ip_matches_pattern("10.0.0.1", "10.0.0.0/32"));
    }

    #[test]
    fn ipv4_mapped_ipv6_normalized() {
        assert!(ip_matches_pattern("::ffff:10.0.0.5", "10.0.0.0/24"));
    }

    #[test]
    fn disabled_always_allows() {
        let controller = IpAccessController::new(false, vec![], vec!["10.0.0.0/8".into()], 10, 1000, 0);
        assert!(controller.check("10.1.1.1", None).is_ok());
    }

    #[test]
    fn denylist_blocks() {
        let controller = IpAccessController::new(true, vec![], vec!["10.0.0.0/8".into()], 10, 1000, 0);
        assert_eq!(controller.check("10.1.1.1", None), Err(DenyReason::IpBlocked));
    }

    #[test]
    fn auto_block_after_threshold() {
        let controller = IpAccessController::new(true, vec![], vec!["10.0.0.0/8".into()], 2, 60_000, 0);
        let _ = controller.check("10.1.1.1", None);
        let _ = controller.check("10.1.1.1", None);
        assert!(controller.auto_blocks.contains_key("10.1.1.1"));
    }

    #[test]
    fn resolve_client_ip_prefers_xff() {
        let controller = IpAccessController::new(true, vec![], vec![], 10, 1000, 0);
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.1.1.1, 2.2.2.2".parse().unwrap());
        assert_eq!(controller.resolve_client_ip(&headers, None), "2.2.2.2");
    }
}
