//! Content-addressed response cache with single-flight coalescing (§4.8).
//! DashMap-plus-entry-lock shape grounded in the teacher's
//! `TokenBlacklistService`/`RateLimiter`; single-flight uses a `Notify`
//! registered under the cache-key lock so waiters never block on the cache
//! lock itself (§5).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;

#[derive(Clone)]
struct CacheEntry {
    result: Value,
    expires_at: DateTime<Utc>,
    inserted_at: DateTime<Utc>,
}

enum Slot {
    Ready(CacheEntry),
    InFlight(Arc<Notify>),
}

pub struct ResponseCache {
    entries: Arc<DashMap<String, Slot>>,
    cap: usize,
}

pub struct CacheKey(String);

impl ResponseCache {
    pub fn new(cap: usize) -> Self {
        Self { entries: Arc::new(DashMap::new()), cap }
    }

    pub fn key_for(tool: &str, arguments: &Value) -> CacheKey {
        let canonical = canonical_json(arguments);
        let hash = hex::encode(Sha256::digest(canonical.as_bytes()));
        CacheKey(format!("{tool}:{hash}"))
    }

    /// Returns `Some(result)` on a live hit. If another caller's lookup for
    /// this exact key is already resolving the miss, waits on its `Notify`
    /// and re-checks once woken (single-flight fan-out).
    pub async fn lookup(&self, key: &CacheKey) -> CacheLookup {
        loop {
            match self.entries.get(&key.0).map(|e| match &*e {
                Slot::Ready(entry) => LookupState::Ready(entry.clone()),
                Slot::InFlight(notify) => LookupState::InFlight(notify.clone()),
            }) {
                Some(LookupState::Ready(entry)) => {
                    if entry.expires_at > Utc::now() {
                        return CacheLookup::Hit(entry.result);
                    }
                    self.entries.remove(&key.0);
                    return CacheLookup::Miss(self.claim(key));
                }
                Some(LookupState::InFlight(notify)) => {
                    notify.notified().await;
                    continue;
                }
                None => {
                    return CacheLookup::Miss(self.claim(key));
                }
            }
        }
    }

    /// Marks this key in-flight and returns a guard the caller must resolve
    /// with `populate` or `abandon` (on backend error, per spec, errors are
    /// not cached).
    fn claim(&self, key: &CacheKey) -> InFlightGuard {
        let notify = Arc::new(Notify::new());
        self.entries.insert(key.0.clone(), Slot::InFlight(notify.clone()));
        InFlightGuard { key: key.0.clone(), notify }
    }

    pub fn populate(&self, guard: InFlightGuard, result: Value, ttl_seconds: u64) {
        if ttl_seconds == 0 {
            self.entries.remove(&guard.key);
            guard.notify.notify_waiters();
            return;
        }
        let now = Utc::now();
        let entry = CacheEntry { result, expires_at: now + chrono::Duration::seconds(ttl_seconds as i64), inserted_at: now };
        self.entries.insert(guard.key.clone(), Slot::Ready(entry));
        guard.notify.notify_waiters();
        self.evict_if_over_cap();
    }

    /// Backend failed; do not cache the error, just release waiters.
    pub fn abandon(&self, guard: InFlightGuard) {
        self.entries.remove(&guard.key);
        guard.notify.notify_waiters();
    }

    pub fn invalidate(&self, tool: &str) {
        let prefix = format!("{tool}:");
        self.entries.retain(|k, _| !k.starts_with(&prefix));
    }

    fn evict_if_over_cap(&self) {
        if self.entries.len() <= self.cap {
            return;
        }
        let mut ready: Vec<(String, DateTime<Utc>)> = self
            .entries
            .iter()
            .filter_map(|e| match &*e {
                Slot::Ready(entry) => Some((e.key().clone(), entry.inserted_at)),
                Slot::InFlight(_) => None,
            })
            .collect();
        ready.sort_by_key(|(_, inserted_at)| *inserted_at);
        let overflow = self.entries.len().saturating_sub(self.cap);
        for (key, _) in ready.into_iter().take(overflow) {
            self.entries.remove(&key);
        }
    }
}

enum LookupState {
    Ready(CacheEntry),
    InFlight(Arc<Notify>),
}

pub enum CacheLookup {
    Hit(Value),
    Miss(InFlightGuard),
}

pub struct InFlightGuard {
    key: String,
    notify: Arc<Notify>,
}

fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<(String, Value)> = map.iter().map(|(k, v)| (k.clone(), sort(v))).collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                Value::Object(entries.into_iter().collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort(value)).unwrap_or_default()
}
