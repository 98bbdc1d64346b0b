//! Per-key daily/monthly call and credit counters with calendar rollover
//! (§4.3). Counters live on the `ApiKey` record itself; this service only
//! carries the comparison/reset/increment logic, mutating through
//! `KeyStore::with_quota_counters_mut` so there is one owner of the field.

use chrono::{DateTime, Utc};

use crate::error::DenyReason;
use crate::models::{ApiKey, QuotaConfig};
use crate::services::key_store::KeyStore;

pub struct QuotaTracker {
    default_quota: QuotaConfig,
}

impl QuotaTracker {
    pub fn new(default_quota: QuotaConfig) -> Self {
        Self { default_quota }
    }

    /// Resets counters first if the calendar boundary (UTC) has been
    /// crossed, then checks the four thresholds. Limits of 0 mean unlimited.
    /// Only increments on successful admission (pipeline calls `record`
    /// separately once the call is otherwise fully admitted).
    pub fn check(&self, store: &KeyStore, key: &ApiKey, effective_quota: Option<&QuotaConfig>, credits_required: u64, now: DateTime<Utc>) -> Result<(), DenyReason> {
        self.roll_if_needed(store, key, now);
        let key = store.get_key_raw(&key.id).unwrap_or_else(|| key.clone());
        let quota = effective_quota.unwrap_or(&self.default_quota);
        let counters = &key.quota_counters;

        if quota.daily_call_limit != 0 && counters.daily_calls + 1 > quota.daily_call_limit {
            return Err(DenyReason::DailyCalls);
        }
        if quota.monthly_call_limit != 0 && counters.monthly_calls + 1 > quota.monthly_call_limit {
            return Err(DenyReason::MonthlyCalls);
        }
        if quota.daily_credit_limit != 0 && counters.daily_credits + credits_required > quota.daily_credit_limit {
            return Err(DenyReason::DailyCredits);
        }
        if quota.monthly_credit_limit != 0 && counters.monthly_credits + credits_required > quota.monthly_credit_limit {
            return Err(DenyReason::MonthlyCredits);
        }
        Ok(())
    }

    pub fn record(&self, store: &KeyStore, key_id: &str, credits_charged: u64) {
        store.with_quota_counters_mut(key_id, |counters| {
            counters.daily_calls += 1;
            counters.monthly_calls += 1;
            counters.daily_credits += credits_charged;
            counters.monthly_credits += credits_charged;
        });
    }

    /// Undoes a `record` on refund; subtraction is saturating so a
    /// concurrent reset never underflows.
    pub fn unrecord(&self, store: &KeyStore, key_id: &str, credits_charged: u64) {
        store.with_quota_counters_mut(key_id, |counters| {
            counters.daily_calls = counters.daily_calls.saturating_sub(1);
            counters.monthly_calls = counters.monthly_calls.saturating_sub(1);
            counters.daily_credits = counters.daily_credits.saturating_sub(credits_charged);
            counters.monthly_credits = counters.monthly_credits.saturating_sub(credits_charged);
        });
    }

    fn roll_if_needed(&self, store: &KeyStore, key: &ApiKey, now: DateTime<Utc>) {
        let today = now.format("%Y-%m-%d").to_string();
        let month = now.format("%Y-%m").to_string();
        if key.quota_counters.last_reset_day == today && key.quota_counters.last_reset_month == month {
            return;
        }
        store.with_quota_counters_mut(&key.id, |counters| {
            if counters.last_reset_day != today {
                counters.daily_calls = 0;
                counters.daily_credits = 0;
                counters.last_reset_day = today.clone();
            }
            if counters.last_reset_month != month {
                counters.monthly_calls = 0;
                counters.monthly_credits = 0;
                counters.last_reset_month = month.clone();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::key_store::{CreateKeyParams, KeyStore};
    use chrono::Duration as ChronoDuration;

    fn store() -> KeyStore {
        KeyStore::load(std::env::temp_dir().join(format!("paygate-quota-test-{}.json", uuid::Uuid::new_v4())))
    }

    #[test]
    fn zero_limit_is_unlimited() {
        let store = store();
        let key = store.create_key(CreateKeyParams { credits: 1000, ..Default::default() }).unwrap();
        let tracker = QuotaTracker::new(QuotaConfig::default());
        assert!(tracker.check(&store, &key, None, 1, Utc::now()).is_ok());
    }

    #[test]
    fn denies_over_daily_call_limit() {
        let store = store();
        let key = store.create_key(CreateKeyParams { credits: 1000, ..Default::default() }).unwrap();
        let quota = QuotaConfig { daily_call_limit: 1, ..Default::default() };
        let tracker = QuotaTracker::new(QuotaConfig::default());
        assert!(tracker.check(&store, &key, Some(&quota), 1, Utc::now()).is_ok());
        tracker.record(&store, &key.id, 1);
        let key = store.get_key_raw(&key.id).unwrap();
        assert_eq!(
            tracker.check(&store, &key, Some(&quota), 1, Utc::now()),
            Err(DenyReason::DailyCalls)
        );
    }

    #[test]
    fn calendar_rollover_resets_once_per_day() {
        let store = store();
        let key = store.create_key(CreateKeyParams { credits: 1000, ..Default::default() }).unwrap();
        let tracker = QuotaTracker::new(QuotaConfig::default());
        tracker.record(&store, &key.id, 5);
        let yesterday = Utc::now() - ChronoDuration::days(1);
        store.with_quota_counters_mut(&key.id, |c| {
            c.last_reset_day = yesterday.format("%Y-%m-%d").to_string();
        });
        let key = store.get_key_raw(&key.id).unwrap();
        tracker.roll_if_needed(&store, &key, Utc::now());
        let key = store.get_key_raw(&key.id).unwrap();
        assert_eq!(key.quota_counters.daily_calls, 0);
        assert_eq!(key.quota_counters.daily_credits, 0);
    }
}
