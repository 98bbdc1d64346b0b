//! Append-only ring buffer of usage events with bounded retention (§4.10).
//! Single-mutex linear-scan shape mirrors the teacher's
//! `TokenBlacklistService::stats` aggregation style; tool/per-key summaries
//! recompute on every call rather than being persisted incrementally,
//! avoiding drift per §4.10.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::models::UsageEvent;

pub struct UsageMeter {
    capacity: usize,
    events: Mutex<VecDeque<UsageEvent>>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct UsageSummary {
    pub total_calls: u64,
    pub allowed_calls: u64,
    pub denied_calls: u64,
    pub total_credits_charged: u64,
}

impl UsageMeter {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))) }
    }

    pub fn record(&self, event: UsageEvent) {
        let mut events = self.events.lock().unwrap();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn get_events(&self, since: Option<DateTime<Utc>>, namespace: Option<&str>) -> Vec<UsageEvent> {
        let events = self.events.lock().unwrap();
        events
            .iter()
            .filter(|e| since.map(|s| e.timestamp >= s).unwrap_or(true))
            .filter(|e| namespace.map(|ns| e.namespace == ns).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn get_summary(&self, since: Option<DateTime<Utc>>, namespace: Option<&str>) -> UsageSummary {
        let events = self.get_events(since, namespace);
        let mut summary = UsageSummary::default();
        for e in &events {
            summary.total_calls += 1;
            if e.allowed {
                summary.allowed_calls += 1;
            } else {
                summary.denied_calls += 1;
            }
            summary.total_credits_charged += e.credits_charged;
        }
        summary
    }
}
