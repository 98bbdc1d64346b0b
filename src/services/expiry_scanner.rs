//! Periodic sweep flagging keys approaching expiry (§4.14). Grounded in the
//! teacher's `alert_scheduler_service`-style background `tokio::spawn` loop
//! started from `main`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::services::audit_log::{Actor, AuditLog};
use crate::services::key_store::KeyStore;

const DEFAULT_THRESHOLDS_SECS: [i64; 3] = [7 * 24 * 3600, 24 * 3600, 3600];

pub struct ExpiryScanner {
    thresholds_secs: Vec<i64>,
    /// De-dup set of `(key_id, threshold_secs)` already notified.
    notified: Mutex<HashSet<(String, i64)>>,
}

impl ExpiryScanner {
    pub fn new() -> Self {
        let mut thresholds: Vec<i64> = DEFAULT_THRESHOLDS_SECS.to_vec();
        thresholds.sort_unstable_by(|a, b| b.cmp(a)); // largest first
        Self { thresholds_secs: thresholds, notified: Mutex::new(HashSet::new()) }
    }

    pub async fn scan(&self, store: &KeyStore, audit: &AuditLog) {
        let now = Utc::now();
        let mut notified = self.notified.lock().await;

        for (key_id, threshold) in self.candidates(store, now).await {
            if notified.contains(&(key_id.clone(), threshold)) {
                continue;
            }
            notified.insert((key_id.clone(), threshold));
            audit.log(
                "key_expiry_warning",
                Actor::System,
                Some(key_id.clone()),
                &format!("key expires within {threshold}s"),
                serde_json::json!({ "thresholdSeconds": threshold }),
            );
        }
    }

    async fn candidates(&self, store: &KeyStore, now: chrono::DateTime<Utc>) -> Vec<(String, i64)> {
        let mut out = Vec::new();
        for id in store.all_key_ids() {
            let Some(key) = store.get_key_raw(&id) else { continue };
            if !key.active || key.revoked {
                continue;
            }
            let Some(expires_at) = key.expires_at else { continue };
            let remaining = (expires_at - now).num_seconds();
            if remaining <= 0 {
                continue;
            }
            for threshold in &self.thresholds_secs {
                if remaining <= *threshold {
                    out.push((key.id.clone(), *threshold));
                    break;
                }
            }
        }
        out
    }

    pub async fn clear_notified(&self) {
        self.notified.lock().await.clear();
    }

    pub fn spawn(self: Arc<Self>, store: Arc<KeyStore>, audit: Arc<AuditLog>, interval: Duration) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                self.scan(&store, &audit).await;
            }
        });
    }
}

impl Default for ExpiryScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::key_store::CreateKeyParams;

    #[tokio::test]
    async fn flags_key_within_threshold() {
        let store = KeyStore::load(std::env::temp_dir().join(format!("paygate-exp-test-{}.json", uuid::Uuid::new_v4())));
        let key = store.create_key(CreateKeyParams::default()).unwrap();
        store.set_expiry(&key.id, Some(Utc::now() + chrono::Duration::minutes(30)));
        let audit = AuditLog::new(100);
        let scanner = ExpiryScanner::new();
        scanner.scan(&store, &audit).await;
        let events = audit.get_events(None);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "key_expiry_warning");
    }

    #[tokio::test]
    async fn does_not_renotify_same_threshold() {
        let store = KeyStore::load(std::env::temp_dir().join(format!("paygate-exp-test2-{}.json", uuid::Uuid::new_v4())));
        let key = store.create_key(CreateKeyParams::default()).unwrap();
        store.set_expiry(&key.id, Some(Utc::now() + chrono::Duration::minutes(30)));
        let audit = AuditLog::new(100);
        let scanner = ExpiryScanner::new();
        scanner.scan(&store, &audit).await;
        scanner.scan(&store, &audit).await;
        assert_eq!(audit.get_events(None).len(), 1);
    }

    #[tokio::test]
    async fn clear_notified_allows_renotify() {
        let store = KeyStore::load(std::env::temp_dir().join(format!("paygate-exp-test3-{}.json", uuid::Uuid::new_v4())));
        let key = store.create_key(CreateKeyParams::default()).unwrap();
        store.set_expiry(&key.id, Some(Utc::now() + chrono::Duration::minutes(30)));
        let audit = AuditLog::new(100);
        let scanner = ExpiryScanner::new();
        scanner.scan(&store, &audit).await;
        scanner.clear_notified().await;
        scanner.scan(&store, &audit).await;
        assert_eq!(audit.get_events(None).len(), 2);
    }
}
