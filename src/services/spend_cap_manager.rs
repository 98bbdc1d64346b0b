//! Server-wide daily caps and per-key hourly caps, with auto-suspend/resume
//! (§4.4). Grounded in the teacher's `TokenBlacklistService` for the
//! DashMap-plus-sweep idiom backing the per-key hourly buckets.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::DenyReason;
use crate::services::key_store::KeyStore;

struct ServerDailyCounters {
    day_marker: Mutex<String>,
    calls: AtomicU64,
    credits: AtomicU64,
}

#[derive(Default, Clone)]
struct HourlyBucket {
    hour_marker: String,
    calls: u64,
    credits: u64,
}

pub struct SpendCapManager {
    server_daily_call_cap: u64,
    server_daily_credit_cap: u64,
    hourly_call_cap: u64,
    hourly_credit_cap: u64,
    breach_action_suspend: bool,
    auto_resume_after_seconds: u64,

    server: ServerDailyCounters,
    hourly: Arc<DashMap<String, HourlyBucket>>,
}

impl SpendCapManager {
    pub fn new(
        server_daily_call_cap: u64,
        server_daily_credit_cap: u64,
        hourly_call_cap: u64,
        hourly_credit_cap: u64,
        breach_action_suspend: bool,
        auto_resume_after_seconds: u64,
    ) -> Self {
        Self {
            server_daily_call_cap,
            server_daily_credit_cap,
            hourly_call_cap,
            hourly_credit_cap,
            breach_action_suspend,
            auto_resume_after_seconds,
            server: ServerDailyCounters {
                day_marker: Mutex::new(Utc::now().format("%Y-%m-%d").to_string()),
                calls: AtomicU64::new(0),
                credits: AtomicU64::new(0),
            },
            hourly: Arc::new(DashMap::new()),
        }
    }

    pub async fn check_server_cap(&self, credits_required: u64, now: DateTime<Utc>) -> Result<(), DenyReason> {
        self.maybe_reset_server_day(now).await;
        if self.server_daily_call_cap != 0 && self.server.calls.load(Ordering::SeqCst) + 1 > self.server_daily_call_cap {
            return Err(DenyReason::ServerDailyCallCap);
        }
        if self.server_daily_credit_cap != 0
            && self.server.credits.load(Ordering::SeqCst) + credits_required > self.server_daily_credit_cap
        {
            return Err(DenyReason::ServerDailyCreditCap);
        }
        Ok(())
    }

    pub fn check_hourly_cap(&self, key_id: &str, credits_required: u64, now: DateTime<Utc>) -> Result<(), DenyReason> {
        let hour_marker = now.format("%Y-%m-%dT%H").to_string();
        let mut bucket = self.hourly.entry(key_id.to_string()).or_insert_with(HourlyBucket::default);
        if bucket.hour_marker != hour_marker {
            *bucket = HourlyBucket { hour_marker: hour_marker.clone(), calls: 0, credits: 0 };
        }
        if self.hourly_call_cap != 0 && bucket.calls + 1 > self.hourly_call_cap {
            return Err(DenyReason::HourlyCallCap);
        }
        if self.hourly_credit_cap != 0 && bucket.credits + credits_required > self.hourly_credit_cap {
            return Err(DenyReason::HourlyCreditCap);
        }
        Ok(())
    }

    /// Records an admitted call against both layers' counters.
    pub async fn record(&self, key_id: &str, credits_charged: u64, now: DateTime<Utc>) {
        self.maybe_reset_server_day(now).await;
        self.server.calls.fetch_add(1, Ordering::SeqCst);
        self.server.credits.fetch_add(credits_charged, Ordering::SeqCst);

        let hour_marker = now.format("%Y-%m-%dT%H").to_string();
        let mut bucket = self.hourly.entry(key_id.to_string()).or_insert_with(HourlyBucket::default);
        if bucket.hour_marker != hour_marker {
            *bucket = HourlyBucket { hour_marker, calls: 0, credits: 0 };
        }
        bucket.calls += 1;
        bucket.credits += credits_charged;
    }

    /// On breach, consults `breach_action_suspend`; if set, auto-suspends
    /// the key via `KeyStore` and the caller is expected to emit an
    /// audit/webhook event (the teacher's injected-callback pattern is
    /// replaced here by the Gate owning the event channel, per §9).
    pub fn on_breach(&self, store: &KeyStore, key_id: &str, now: DateTime<Utc>) -> bool {
        if self.breach_action_suspend {
            store.auto_suspend(key_id, now)
        } else {
            false
        }
    }

    /// Returns true and clears the suspend if the cooldown has elapsed.
    pub fn maybe_auto_resume(&self, store: &KeyStore, key_id: &str, now: DateTime<Utc>) -> bool {
        if self.auto_resume_after_seconds == 0 {
            return false;
        }
        let Some(key) = store.get_key_raw(key_id) else { return false };
        let Some(suspended_at) = key.auto_suspended_at else { return false };
        if (now - suspended_at).num_seconds() as u64 >= self.auto_resume_after_seconds {
            store.auto_resume(key_id)
        } else {
            false
        }
    }

    async fn maybe_reset_server_day(&self, now: DateTime<Utc>) {
        let today = now.format("%Y-%m-%d").to_string();
        let mut marker = self.server.day_marker.lock().await;
        if *marker != today {
            *marker = today;
            self.server.calls.store(0, Ordering::SeqCst);
            self.server.credits.store(0, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::key_store::{CreateKeyParams, KeyStore};

    #[tokio::test]
    async fn server_cap_denies_over_limit() {
        let mgr = SpendCapManager::new(1, 0, 0, 0, true, 0);
        let now = Utc::now();
        assert!(mgr.check_server_cap(1, now).await.is_ok());
        mgr.record("k", 1, now).await;
        assert_eq!(mgr.check_server_cap(1, now).await, Err(DenyReason::ServerDailyCallCap));
    }

    #[test]
    fn hourly_cap_denies_over_limit() {
        let mgr = SpendCapManager::new(0, 0, 1, 0, true, 0);
        let now = Utc::now();
        assert!(mgr.check_hourly_cap("k", 1, now).is_ok());
    }

    #[tokio::test]
    async fn auto_suspend_and_resume() {
        let store = KeyStore::load(std::env::temp_dir().join(format!("paygate-cap-test-{}.json", uuid::Uuid::new_v4())));
        let key = store.create_key(CreateKeyParams::default()).unwrap();
        let mgr = SpendCapManager::new(0, 0, 0, 0, true, 0);
        let now = Utc::now();
        assert!(mgr.on_breach(&store, &key.id, now));
        let key = store.get_key_raw(&key.id).unwrap();
        assert!(key.suspended);
    }
}
