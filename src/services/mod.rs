pub mod audit_log;
pub mod circuit_breaker;
pub mod expiry_scanner;
pub mod ip_access_controller;
pub mod key_group_manager;
pub mod key_store;
pub mod quota_tracker;
pub mod rate_limiter;
pub mod request_signer;
pub mod response_cache;
pub mod spend_cap_manager;
pub mod usage_meter;
pub mod webhook_queue;
