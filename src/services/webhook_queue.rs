//! Bounded retry queue with exponential backoff and a dead-letter partition
//! (§4.11, contract only). No delivery worker here — out of core scope; the
//! Gate/Dispatcher only enqueue.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookState {
    Pending,
    Delivered,
    Dead,
}

#[derive(Debug, Clone)]
pub struct WebhookEntry {
    pub id: String,
    pub url: String,
    pub payload: Value,
    pub state: WebhookState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
}

pub struct EnqueueParams {
    pub url: String,
    pub payload: Value,
    pub max_attempts: u32,
}

const BASE_DELAY_SECS: i64 = 5;
const BACKOFF_MULTIPLIER: f64 = 2.0;
const MAX_DELAY_SECS: i64 = 3600;

pub struct WebhookQueue {
    capacity: usize,
    entries: Mutex<VecDeque<WebhookEntry>>,
}

impl WebhookQueue {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: Mutex::new(VecDeque::new()) }
    }

    pub fn enqueue(&self, params: EnqueueParams) -> String {
        let id = format!("wh_{}", Uuid::new_v4().simple());
        let entry = WebhookEntry {
            id: id.clone(),
            url: params.url,
            payload: params.payload,
            state: WebhookState::Pending,
            attempts: 0,
            max_attempts: params.max_attempts,
            next_attempt_at: Utc::now(),
        };
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        id
    }

    /// Returns the oldest pending entry whose `next_attempt_at <= now`.
    pub fn dequeue(&self, now: DateTime<Utc>) -> Option<WebhookEntry> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .find(|e| e.state == WebhookState::Pending && e.next_attempt_at <= now)
            .cloned()
    }

    pub fn mark_delivered(&self, id: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            entry.state = WebhookState::Delivered;
        }
    }

    /// Reschedules with backoff or transitions to dead when attempts are
    /// exhausted.
    pub fn mark_failed(&self, id: &str, now: DateTime<Utc>) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            entry.attempts += 1;
            if entry.attempts >= entry.max_attempts {
                entry.state = WebhookState::Dead;
            } else {
                let delay_secs = (BASE_DELAY_SECS as f64 * BACKOFF_MULTIPLIER.powi(entry.attempts as i32 - 1))
                    .min(MAX_DELAY_SECS as f64) as i64;
                entry.next_attempt_at = now + chrono::Duration::seconds(delay_secs);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dequeue_returns_oldest_ready() {
        let queue = WebhookQueue::new(10);
        let id = queue.enqueue(EnqueueParams { url: "http://x".into(), payload: json!({}), max_attempts: 3 });
        let entry = queue.dequeue(Utc::now()).unwrap();
        assert_eq!(entry.id, id);
    }

    #[test]
    fn mark_failed_reschedules_until_max_attempts() {
        let queue = WebhookQueue::new(10);
        let id = queue.enqueue(EnqueueParams { url: "http://x".into(), payload: json!({}), max_attempts: 2 });
        let now = Utc::now();
        queue.mark_failed(&id, now);
        let entries = queue.entries.lock().unwrap();
        let entry = entries.iter().find(|e| e.id == id).unwrap();
        assert_eq!(entry.state, WebhookState::Pending);
        assert!(entry.next_attempt_at > now);
        drop(entries);
        queue.mark_failed(&id, now);
        let entries = queue.entries.lock().unwrap();
        let entry = entries.iter().find(|e| e.id == id).unwrap();
        assert_eq!(entry.state, WebhookState::Dead);
    }

    #[test]
    fn mark_delivered_transitions_state() {
        let queue = WebhookQueue::new(10);
        let id = queue.enqueue(EnqueueParams { url: "http://x".into(), payload: json!({}), max_attempts: 3 });
        queue.mark_delivered(&id);
        assert!(queue.dequeue(Utc::now()).is_none());
    }
}
