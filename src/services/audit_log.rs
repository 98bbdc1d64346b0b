//! Append-only administrative event log with size-bounded metadata (§4.15).
//! The "many specific log_* methods delegating to one generic append" shape
//! is grounded in the teacher's `AuditService`, converted here to an
//! in-memory ring buffer (no database).

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

const METADATA_LIMIT_BYTES: usize = 10 * 1024;
const MESSAGE_LIMIT_CHARS: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Admin,
    System,
    /// Carries the masked key prefix.
    Key,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event_type: String,
    pub actor: Actor,
    pub actor_detail: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
}

pub struct AuditLog {
    capacity: usize,
    events: Mutex<VecDeque<AuditEvent>>,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))) }
    }

    pub fn log(&self, event_type: &str, actor: Actor, actor_detail: Option<String>, message: &str, metadata: Value) {
        let message = truncate_chars(message, MESSAGE_LIMIT_CHARS);
        let metadata = sanitize_metadata(metadata);

        let event = AuditEvent {
            event_type: event_type.to_string(),
            actor,
            actor_detail,
            message,
            timestamp: Utc::now(),
            metadata,
        };

        let mut events = self.events.lock().unwrap();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn log_key_suspended(&self, key_prefix: &str, reason: &str) {
        self.log(
            "key_suspended",
            Actor::System,
            Some(key_prefix.to_string()),
            &format!("key auto-suspended: {reason}"),
            serde_json::json!({ "reason": reason }),
        );
    }

    pub fn log_key_created(&self, key_prefix: &str, actor: Actor) {
        self.log("key_created", actor, Some(key_prefix.to_string()), "key created", serde_json::json!({}));
    }

    pub fn log_state_persist_failed(&self, error: &str) {
        self.log(
            "state_persist_failed",
            Actor::System,
            None,
            "failed to write state snapshot; continuing in memory",
            serde_json::json!({ "error": error }),
        );
    }

    pub fn get_events(&self, since: Option<DateTime<Utc>>) -> Vec<AuditEvent> {
        let events = self.events.lock().unwrap();
        events.iter().filter(|e| since.map(|s| e.timestamp >= s).unwrap_or(true)).cloned().collect()
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Serializes metadata and truncates at a hard byte limit; oversize values
/// are replaced with a truncation marker rather than dropped entirely.
fn sanitize_metadata(metadata: Value) -> Value {
    match serde_json::to_vec(&metadata) {
        Ok(bytes) if bytes.len() <= METADATA_LIMIT_BYTES => metadata,
        Ok(bytes) => serde_json::json!({ "_truncated": true, "_originalSize": bytes.len() }),
        Err(_) => serde_json::json!({ "_error": "Metadata not serializable" }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_is_capped() {
        let log = AuditLog::new(10);
        let long_message = "x".repeat(5_000);
        log.log("test", Actor::System, None, &long_message, serde_json::json!({}));
        let events = log.get_events(None);
        assert_eq!(events[0].message.chars().count(), MESSAGE_LIMIT_CHARS);
    }

    #[test]
    fn oversize_metadata_is_truncated() {
        let log = AuditLog::new(10);
        let big_value = serde_json::json!({ "blob": "x".repeat(20 * 1024) });
        log.log("test", Actor::System, None, "msg", big_value);
        let events = log.get_events(None);
        assert_eq!(events[0].metadata["_truncated"], serde_json::json!(true));
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let log = AuditLog::new(2);
        log.log("a", Actor::System, None, "1", serde_json::json!({}));
        log.log("b", Actor::System, None, "2", serde_json::json!({}));
        log.log("c", Actor::System, None, "3", serde_json::json!({}));
        let events = log.get_events(None);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "b");
    }
}
