//! Authoritative map from key identifier to `ApiKey` record (§4.1).
//!
//! Grounded in the teacher's `TokenBlacklistService` (DashMap + periodic
//! sweep) for the in-memory shape, and in `config/mod.rs`'s env-driven
//! startup for the snapshot load/atomic-write discipline.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use tokio::sync::Mutex as AsyncMutex;

use crate::models::{ApiKey, KeyGroup, PersistedState, QuotaCounters};
use crate::services::audit_log::AuditLog;
use crate::services::key_group_manager::KeyGroupManager;

#[derive(Debug, Clone)]
pub struct CreateKeyParams {
    pub alias: Option<String>,
    pub credits: u64,
    pub spending_limit: u64,
    pub namespace: Option<String>,
    pub group_id: Option<String>,
}

impl Default for CreateKeyParams {
    fn default() -> Self {
        Self { alias: None, credits: 0, spending_limit: 0, namespace: None, group_id: None }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("alias already taken")]
    AliasTaken,
    #[error("insufficient credits")]
    InsufficientCredits,
    #[error("key not found")]
    NotFound,
}

/// Masked listing projection, never exposes the full identifier.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MaskedKey {
    pub key_prefix: String,
    pub alias: Option<String>,
    pub namespace: String,
    pub active: bool,
    pub suspended: bool,
    pub expired: bool,
    pub credits: u64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct NamespaceSummary {
    pub namespace: String,
    pub key_count: u64,
    pub active_keys: u64,
    pub total_credits: u64,
}

pub struct KeyStore {
    keys: Arc<DashMap<String, ApiKey>>,
    aliases: Arc<DashMap<String, String>>,
    state_path: PathBuf,
    write_lock: Arc<AsyncMutex<()>>,
    /// Wired in by `attach_persistence` at startup; a bare `KeyStore` (as
    /// constructed by every service's own unit tests) simply never fires a
    /// background snapshot.
    audit_log: OnceLock<Arc<AuditLog>>,
    key_groups: OnceLock<Arc<KeyGroupManager>>,
}

impl KeyStore {
    /// Loads and sanitizes the snapshot if present; never panics on a
    /// corrupted file, logs and starts empty instead.
    pub fn load(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let keys = DashMap::new();
        let aliases = DashMap::new();

        match std::fs::read(&state_path) {
            Ok(bytes) => match serde_json::from_slice::<PersistedState>(&bytes) {
                Ok(persisted) => {
                    for mut key in persisted.keys {
                        sanitize_key(&mut key);
                        if let Some(alias) = &key.alias {
                            aliases.insert(alias.clone(), key.id.clone());
                        }
                        keys.insert(key.id.clone(), key);
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, path = %state_path.display(), "state file corrupt, starting empty");
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(error = %err, path = %state_path.display(), "could not read state file, starting empty");
            }
        }

        Self {
            keys: Arc::new(keys),
            aliases: Arc::new(aliases),
            state_path,
            write_lock: Arc::new(AsyncMutex::new(())),
            audit_log: OnceLock::new(),
            key_groups: OnceLock::new(),
        }
    }

    /// Wires in the collaborators every mutating call needs to persist
    /// itself in the background and to report a write failure (§4.1, §7).
    /// Call once at startup; safe to call on a shared `Arc<KeyStore>`.
    pub fn attach_persistence(&self, audit_log: Arc<AuditLog>, key_groups: Arc<KeyGroupManager>) {
        let _ = self.audit_log.set(audit_log);
        let _ = self.key_groups.set(key_groups);
    }

    pub fn create_key(&self, params: CreateKeyParams) -> Result<ApiKey, KeyStoreError> {
        if let Some(alias) = &params.alias {
            if self.aliases.contains_key(alias) {
                return Err(KeyStoreError::AliasTaken);
            }
        }

        let id = generate_key_id();
        let namespace = sanitize_namespace(params.namespace.as_deref().unwrap_or("default"));
        let now = Utc::now();

        let key = ApiKey {
            id: id.clone(),
            alias: params.alias.clone(),
            credits: params.credits,
            total_spent: 0,
            total_calls: 0,
            created_at: now,
            last_used_at: None,
            active: true,
            suspended: false,
            auto_suspended_at: None,
            expires_at: None,
            spending_limit: params.spending_limit,
            allowed_tools: HashSet::new(),
            denied_tools: HashSet::new(),
            rate_limit_per_min: None,
            ip_allowlist: HashSet::new(),
            quota: None,
            quota_counters: QuotaCounters {
                last_reset_day: today_utc_string(now),
                last_reset_month: month_utc_string(now),
                ..Default::default()
            },
            tags: Default::default(),
            group_id: params.group_id,
            namespace,
            country_allow: HashSet::new(),
            country_deny: HashSet::new(),
            auto_topup: None,
            tool_pricing: Default::default(),
            revoked: false,
            signing_secret: None,
        };

        if let Some(alias) = &params.alias {
            self.aliases.insert(alias.clone(), id.clone());
        }
        self.keys.insert(id, key.clone());
        self.spawn_persist();
        Ok(key)
    }

    /// Returns the record only if it is not a terminal-state hit.
    pub fn get_key(&self, id: &str) -> Option<ApiKey> {
        self.keys.get(id).and_then(|k| {
            if k.revoked || k.is_expired(Utc::now()) {
                None
            } else {
                Some(k.clone())
            }
        })
    }

    /// Returns even terminal records.
    pub fn get_key_raw(&self, id: &str) -> Option<ApiKey> {
        self.keys.get(id).map(|k| k.clone())
    }

    pub fn has_credits(&self, id: &str, n: u64) -> bool {
        self.keys.get(id).map(|k| k.credits >= n).unwrap_or(false)
    }

    pub fn charge(&self, id: &str, n: u64) -> Result<ApiKey, KeyStoreError> {
        let mut entry = self.keys.get_mut(id).ok_or(KeyStoreError::NotFound)?;
        if entry.credits < n {
            return Err(KeyStoreError::InsufficientCredits);
        }
        entry.credits -= n;
        entry.total_spent += n;
        entry.total_calls += 1;
        entry.last_used_at = Some(Utc::now());
        let charged = entry.clone();
        drop(entry);
        self.spawn_persist();
        Ok(charged)
    }

    /// Adds `n` back; never reduces `total_calls`.
    pub fn refund(&self, id: &str, n: u64) -> Option<ApiKey> {
        let mut entry = self.keys.get_mut(id)?;
        entry.credits += n;
        entry.total_spent = entry.total_spent.saturating_sub(n);
        let refunded = entry.clone();
        drop(entry);
        self.spawn_persist();
        Some(refunded)
    }

    /// Adds the post-call surcharge, bounded by remaining credits; never
    /// denies, only consumes what is available.
    pub fn charge_bounded(&self, id: &str, n: u64) -> Option<(u64, ApiKey)> {
        let mut entry = self.keys.get_mut(id)?;
        let charged = n.min(entry.credits);
        entry.credits -= charged;
        entry.total_spent += charged;
        let key = entry.clone();
        drop(entry);
        self.spawn_persist();
        Some((charged, key))
    }

    pub fn set_expiry(&self, id: &str, expires_at: Option<DateTime<Utc>>) -> bool {
        let found = self.keys.get_mut(id).map(|mut k| k.expires_at = expires_at).is_some();
        if found {
            self.spawn_persist();
        }
        found
    }

    pub fn suspend(&self, id: &str) -> bool {
        let found = self.keys.get_mut(id).map(|mut k| k.suspended = true).is_some();
        if found {
            self.spawn_persist();
        }
        found
    }

    pub fn resume(&self, id: &str) -> bool {
        let found = self
            .keys
            .get_mut(id)
            .map(|mut k| {
                k.suspended = false;
                k.auto_suspended_at = None;
            })
            .is_some();
        if found {
            self.spawn_persist();
        }
        found
    }

    pub fn revoke(&self, id: &str) -> bool {
        let found = self.keys.get_mut(id).map(|mut k| k.revoked = true).is_some();
        if found {
            self.spawn_persist();
        }
        found
    }

    /// Registers (or rotates) the per-key HMAC signing secret (§4.6),
    /// hex-encoded so it round-trips through the JSON snapshot like every
    /// other field. `None` unregisters signing for the key.
    pub fn set_signing_secret(&self, id: &str, secret: Option<String>) -> bool {
        let found = self.keys.get_mut(id).map(|mut k| k.signing_secret = secret).is_some();
        if found {
            self.spawn_persist();
        }
        found
    }

    /// Allocates a new identifier carrying the same record; the old id's
    /// record is revoked so it can never be admitted again.
    pub fn rotate_key(&self, id: &str) -> Option<ApiKey> {
        let mut old = self.keys.get_mut(id)?;
        old.revoked = true;
        let mut new_key = old.clone();
        drop(old);
        new_key.id = generate_key_id();
        new_key.revoked = false;
        if let Some(alias) = &new_key.alias {
            self.aliases.insert(alias.clone(), new_key.id.clone());
        }
        self.keys.insert(new_key.id.clone(), new_key.clone());
        self.spawn_persist();
        Some(new_key)
    }

    pub fn set_tags(&self, id: &str, tags: std::collections::HashMap<String, String>) -> bool {
        let found = self
            .keys
            .get_mut(id)
            .map(|mut k| {
                k.tags = tags
                    .into_iter()
                    .map(|(key, value)| (truncate(&key, 256), truncate(&value, 256)))
                    .collect();
            })
            .is_some();
        if found {
            self.spawn_persist();
        }
        found
    }

    /// Admin-provided identifier, used only for testing/migration.
    pub fn import_key(&self, key: ApiKey) {
        if let Some(alias) = &key.alias {
            self.aliases.insert(alias.clone(), key.id.clone());
        }
        self.keys.insert(key.id.clone(), key);
        self.spawn_persist();
    }

    pub fn list_keys(&self, namespace: Option<&str>) -> Vec<MaskedKey> {
        let now = Utc::now();
        self.keys
            .iter()
            .filter(|entry| namespace.map(|ns| entry.namespace == ns).unwrap_or(true))
            .map(|entry| MaskedKey {
                key_prefix: entry.masked_prefix(),
                alias: entry.alias.clone(),
                namespace: entry.namespace.clone(),
                active: entry.active,
                suspended: entry.suspended,
                expired: entry.is_expired(now),
                credits: entry.credits,
            })
            .collect()
    }

    /// All identifiers, including terminal-state records. Used by
    /// infrequent sweeps (expiry scan) that need raw records, not the
    /// masked listing projection.
    pub fn all_key_ids(&self) -> Vec<String> {
        self.keys.iter().map(|e| e.key().clone()).collect()
    }

    pub fn list_namespaces(&self) -> Vec<NamespaceSummary> {
        let mut by_ns: std::collections::HashMap<String, NamespaceSummary> = std::collections::HashMap::new();
        for entry in self.keys.iter() {
            let summary = by_ns.entry(entry.namespace.clone()).or_insert_with(|| NamespaceSummary {
                namespace: entry.namespace.clone(),
                ..Default::default()
            });
            summary.key_count += 1;
            if entry.active {
                summary.active_keys += 1;
            }
            summary.total_credits += entry.credits;
        }
        by_ns.into_values().collect()
    }

    /// Applies the key's record to update its embedded quota counters;
    /// exposed so `QuotaTracker` can mutate through one owner.
    pub fn with_quota_counters_mut<F: FnOnce(&mut QuotaCounters)>(&self, id: &str, f: F) -> bool {
        let found = self
            .keys
            .get_mut(id)
            .map(|mut k| {
                f(&mut k.quota_counters);
            })
            .is_some();
        if found {
            self.spawn_persist();
        }
        found
    }

    pub fn auto_suspend(&self, id: &str, at: DateTime<Utc>) -> bool {
        let found = self
            .keys
            .get_mut(id)
            .map(|mut k| {
                k.suspended = true;
                k.auto_suspended_at = Some(at);
            })
            .is_some();
        if found {
            self.spawn_persist();
        }
        found
    }

    pub fn auto_resume(&self, id: &str) -> bool {
        let found = self
            .keys
            .get_mut(id)
            .map(|mut k| {
                if k.auto_suspended_at.is_some() {
                    k.suspended = false;
                    k.auto_suspended_at = None;
                }
            })
            .is_some();
        if found {
            self.spawn_persist();
        }
        found
    }

    /// Serializes the full map to a JSON snapshot atomically: write to
    /// `.tmp`, then rename. Failures are logged, reported to the audit log
    /// when one is attached, and swallowed — best-effort durability per
    /// §4.1.
    pub async fn persist(&self, groups: Vec<KeyGroup>) {
        Self::write_snapshot(self.keys.clone(), groups, self.state_path.clone(), self.write_lock.clone(), self.audit_log.get().cloned())
            .await;
    }

    /// Fires a background snapshot write after a mutation, without blocking
    /// the caller — §4.1's "persist on every mutation" contract would
    /// otherwise put a disk write on every credit charge. A no-op until
    /// `attach_persistence` has registered a `KeyGroupManager` (every bare
    /// `KeyStore` built by a service's own unit tests never fires one).
    fn spawn_persist(&self) {
        let Some(key_groups) = self.key_groups.get().cloned() else { return };
        let keys = self.keys.clone();
        let state_path = self.state_path.clone();
        let write_lock = self.write_lock.clone();
        let audit_log = self.audit_log.get().cloned();
        tokio::spawn(async move {
            Self::write_snapshot(keys, key_groups.list(), state_path, write_lock, audit_log).await;
        });
    }

    async fn write_snapshot(
        keys: Arc<DashMap<String, ApiKey>>,
        groups: Vec<KeyGroup>,
        state_path: PathBuf,
        write_lock: Arc<AsyncMutex<()>>,
        audit_log: Option<Arc<AuditLog>>,
    ) {
        let _guard = write_lock.lock().await;
        let state = PersistedState { keys: keys.iter().map(|e| e.clone()).collect(), groups };
        let Ok(bytes) = serde_json::to_vec_pretty(&state) else {
            tracing::error!("failed to serialize state snapshot");
            if let Some(log) = &audit_log {
                log.log_state_persist_failed("failed to serialize state snapshot");
            }
            return;
        };
        let tmp_path = state_path.with_extension("json.tmp");
        if let Err(err) = tokio::fs::write(&tmp_path, &bytes).await {
            tracing::error!(error = %err, "failed to write state snapshot tmp file");
            if let Some(log) = &audit_log {
                log.log_state_persist_failed(&err.to_string());
            }
            return;
        }
        if let Err(err) = tokio::fs::rename(&tmp_path, &state_path).await {
            tracing::error!(error = %err, "failed to rename state snapshot into place");
            if let Some(log) = &audit_log {
                log.log_state_persist_failed(&err.to_string());
            }
        }
    }
}

fn generate_key_id() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("pg_{}", hex::encode(bytes))
}

fn sanitize_namespace(raw: &str) -> String {
    let cleaned: String = raw.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    let lowered = cleaned.to_lowercase();
    let truncated = truncate(&lowered, 50);
    if truncated.is_empty() {
        "default".to_string()
    } else {
        truncated
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn today_utc_string(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

fn month_utc_string(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

fn sanitize_key(key: &mut ApiKey) {
    key.namespace = sanitize_namespace(&key.namespace);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_state_path() -> PathBuf {
        std::env::temp_dir().join(format!("paygate-test-{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn create_and_charge() {
        let store = KeyStore::load(tmp_state_path());
        let key = store.create_key(CreateKeyParams { credits: 100, ..Default::default() }).unwrap();
        assert!(key.id.starts_with("pg_"));
        let charged = store.charge(&key.id, 10).unwrap();
        assert_eq!(charged.credits, 90);
        assert_eq!(charged.total_spent, 10);
        assert_eq!(charged.total_calls, 1);
    }

    #[test]
    fn charge_fails_on_insufficient_credits() {
        let store = KeyStore::load(tmp_state_path());
        let key = store.create_key(CreateKeyParams { credits: 5, ..Default::default() }).unwrap();
        assert!(matches!(store.charge(&key.id, 10), Err(KeyStoreError::InsufficientCredits)));
    }

    #[test]
    fn refund_never_reduces_total_calls() {
        let store = KeyStore::load(tmp_state_path());
        let key = store.create_key(CreateKeyParams { credits: 100, ..Default::default() }).unwrap();
        store.charge(&key.id, 10).unwrap();
        let refunded = store.refund(&key.id, 10).unwrap();
        assert_eq!(refunded.credits, 100);
        assert_eq!(refunded.total_spent, 0);
        assert_eq!(refunded.total_calls, 1);
    }

    #[test]
    fn revoked_key_is_terminal() {
        let store = KeyStore::load(tmp_state_path());
        let key = store.create_key(CreateKeyParams::default()).unwrap();
        store.revoke(&key.id);
        assert!(store.get_key(&key.id).is_none());
        assert!(store.get_key_raw(&key.id).is_some());
    }

    #[test]
    fn alias_must_be_unique() {
        let store = KeyStore::load(tmp_state_path());
        store
            .create_key(CreateKeyParams { alias: Some("a".into()), ..Default::default() })
            .unwrap();
        let err = store.create_key(CreateKeyParams { alias: Some("a".into()), ..Default::default() });
        assert!(matches!(err, Err(KeyStoreError::AliasTaken)));
    }

    #[test]
    fn namespace_sanitization() {
        assert_eq!(sanitize_namespace("My Tenant!!"), "mytenant");
        assert_eq!(sanitize_namespace(""), "default");
    }
}
