//! Server configuration, loaded from the environment via `dotenvy`, mirroring
//! the teacher's `AppConfig::from_env()` shape.

use anyhow::{Context, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum BackendTransportConfig {
    ChildProcess { command: String, args: Vec<String> },
    Http { base_url: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub admin_key: String,
    pub state_file_path: String,
    pub snapshot_flush_interval: Duration,

    pub backend: BackendTransportConfig,

    pub default_credits_per_call: u64,
    pub default_credits_per_kb_input: u64,
    pub default_credits_per_kb_output: u64,
    pub default_cache_ttl_seconds: u64,

    pub default_daily_call_limit: u64,
    pub default_monthly_call_limit: u64,
    pub default_daily_credit_limit: u64,
    pub default_monthly_credit_limit: u64,

    pub server_daily_call_cap: u64,
    pub server_daily_credit_cap: u64,
    pub hourly_call_cap: u64,
    pub hourly_credit_cap: u64,
    pub breach_action_suspend: bool,
    pub auto_resume_after_seconds: u64,

    pub global_rate_limit_per_min: u64,

    pub ip_access_enabled: bool,
    pub ip_global_allowlist: Vec<String>,
    pub ip_global_denylist: Vec<String>,
    pub auto_block_threshold: u64,
    pub auto_block_duration_ms: i64,
    pub trusted_proxy_depth: u8,

    pub signing_enabled: bool,
    pub signature_tolerance_ms: i64,
    pub nonce_window_ms: i64,
    pub nonce_table_cap: usize,

    pub response_cache_cap: usize,

    pub circuit_breaker_threshold: u64,
    pub circuit_breaker_cooldown_seconds: u64,

    pub usage_event_retention: usize,
    pub audit_log_retention: usize,

    pub refund_on_failure: bool,
    pub shadow_mode: bool,

    pub tool_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub headers_timeout_ms: u64,

    pub country_header_name: String,
    pub free_methods: Vec<String>,

    pub cors_origins: Vec<String>,
    pub max_request_body_bytes: usize,

    pub expiry_scan_interval_seconds: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let backend = if let Ok(base_url) = std::env::var("PAYGATE_BACKEND_HTTP_URL") {
            BackendTransportConfig::Http { base_url }
        } else {
            let command = std::env::var("PAYGATE_BACKEND_COMMAND")
                .unwrap_or_else(|_| "mcp-server".to_string());
            let args = std::env::var("PAYGATE_BACKEND_ARGS")
                .unwrap_or_default()
                .split_whitespace()
                .map(|s| s.to_string())
                .collect();
            BackendTransportConfig::ChildProcess { command, args }
        };

        Ok(Self {
            bind_addr: env_or("PAYGATE_BIND_ADDR", "0.0.0.0:8080"),
            admin_key: std::env::var("PAYGATE_ADMIN_KEY")
                .context("PAYGATE_ADMIN_KEY must be set")?,
            state_file_path: env_or("PAYGATE_STATE_FILE", "state.json"),
            snapshot_flush_interval: Duration::from_secs(env_num("PAYGATE_SNAPSHOT_FLUSH_SECS", 30)),

            backend,

            default_credits_per_call: env_num("PAYGATE_DEFAULT_CREDITS_PER_CALL", 1),
            default_credits_per_kb_input: env_num("PAYGATE_DEFAULT_CREDITS_PER_KB_INPUT", 0),
            default_credits_per_kb_output: env_num("PAYGATE_DEFAULT_CREDITS_PER_KB_OUTPUT", 0),
            default_cache_ttl_seconds: env_num("PAYGATE_DEFAULT_CACHE_TTL_SECONDS", 0),

            default_daily_call_limit: env_num("PAYGATE_DEFAULT_DAILY_CALL_LIMIT", 0),
            default_monthly_call_limit: env_num("PAYGATE_DEFAULT_MONTHLY_CALL_LIMIT", 0),
            default_daily_credit_limit: env_num("PAYGATE_DEFAULT_DAILY_CREDIT_LIMIT", 0),
            default_monthly_credit_limit: env_num("PAYGATE_DEFAULT_MONTHLY_CREDIT_LIMIT", 0),

            server_daily_call_cap: env_num("PAYGATE_SERVER_DAILY_CALL_CAP", 0),
            server_daily_credit_cap: env_num("PAYGATE_SERVER_DAILY_CREDIT_CAP", 0),
            hourly_call_cap: env_num("PAYGATE_HOURLY_CALL_CAP", 0),
            hourly_credit_cap: env_num("PAYGATE_HOURLY_CREDIT_CAP", 0),
            breach_action_suspend: env_bool("PAYGATE_BREACH_ACTION_SUSPEND", true),
            auto_resume_after_seconds: env_num("PAYGATE_AUTO_RESUME_AFTER_SECONDS", 0),

            global_rate_limit_per_min: env_num("PAYGATE_GLOBAL_RATE_LIMIT_PER_MIN", 0),

            ip_access_enabled: env_bool("PAYGATE_IP_ACCESS_ENABLED", false),
            ip_global_allowlist: env_list("PAYGATE_IP_GLOBAL_ALLOWLIST"),
            ip_global_denylist: env_list("PAYGATE_IP_GLOBAL_DENYLIST"),
            auto_block_threshold: env_num("PAYGATE_AUTO_BLOCK_THRESHOLD", 10),
            auto_block_duration_ms: env_num::<i64>("PAYGATE_AUTO_BLOCK_DURATION_MS", 3_600_000),
            trusted_proxy_depth: env_num::<u8>("PAYGATE_TRUSTED_PROXY_DEPTH", 0).clamp(0, 10),

            signing_enabled: env_bool("PAYGATE_SIGNING_ENABLED", false),
            signature_tolerance_ms: env_num("PAYGATE_SIGNATURE_TOLERANCE_MS", 5 * 60 * 1000),
            nonce_window_ms: env_num("PAYGATE_NONCE_WINDOW_MS", 5 * 60 * 1000),
            nonce_table_cap: env_num("PAYGATE_NONCE_TABLE_CAP", 100_000),

            response_cache_cap: env_num("PAYGATE_RESPONSE_CACHE_CAP", 10_000),

            circuit_breaker_threshold: env_num("PAYGATE_CIRCUIT_BREAKER_THRESHOLD", 5),
            circuit_breaker_cooldown_seconds: env_num("PAYGATE_CIRCUIT_BREAKER_COOLDOWN_SECONDS", 30),

            usage_event_retention: env_num("PAYGATE_USAGE_EVENT_RETENTION", 100_000),
            audit_log_retention: env_num("PAYGATE_AUDIT_LOG_RETENTION", 10_000),

            refund_on_failure: env_bool("PAYGATE_REFUND_ON_FAILURE", true),
            shadow_mode: env_bool("PAYGATE_SHADOW_MODE", false),

            tool_timeout_ms: env_num("PAYGATE_TOOL_TIMEOUT_MS", 30_000),
            request_timeout_ms: env_num("PAYGATE_REQUEST_TIMEOUT_MS", 60_000),
            headers_timeout_ms: env_num("PAYGATE_HEADERS_TIMEOUT_MS", 10_000),

            country_header_name: env_or("PAYGATE_COUNTRY_HEADER_NAME", "x-geo-country"),
            free_methods: env_list("PAYGATE_EXTRA_FREE_METHODS"),

            cors_origins: env_list("PAYGATE_CORS_ORIGINS"),
            max_request_body_bytes: env_num("PAYGATE_MAX_REQUEST_BODY_BYTES", 1024 * 1024),

            expiry_scan_interval_seconds: env_num("PAYGATE_EXPIRY_SCAN_INTERVAL_SECONDS", 3600),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_num<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}