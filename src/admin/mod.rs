//! Minimal admin HTTP surface (§6): key CRUD, top-up, lifecycle transitions,
//! group CRUD, maintenance mode, and webhook filter registration. Full admin
//! HTTP framing/routing and analytics/report endpoints are out of core scope;
//! this module is a thin delegation layer over the core services' public
//! operations, grounded in the teacher's `middleware/admin.rs` role-gate
//! pattern (generalized here to the shared-secret `X-Admin-Key` header).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::dispatcher::{Dispatcher, WebhookFilter};
use crate::error::{AppError, Result};
use crate::middleware::admin::admin_key_middleware;
use crate::models::{ApiKey, KeyGroup};
use crate::services::audit_log::AuditLog;
use crate::services::key_group_manager::KeyGroupManager;
use crate::services::key_store::{CreateKeyParams, KeyStore, MaskedKey};
use crate::services::request_signer::RequestSigner;

const MAX_BULK_OPERATION: usize = 100;

#[derive(Clone)]
pub struct AdminState {
    pub key_store: Arc<KeyStore>,
    pub key_groups: Arc<KeyGroupManager>,
    pub audit_log: Arc<AuditLog>,
    pub dispatcher: Arc<Dispatcher>,
    pub maintenance_mode: Arc<AtomicBool>,
}

pub fn router(state: AdminState, config: Arc<AppConfig>) -> Router {
    Router::new()
        .route("/keys", post(create_key).get(list_keys))
        .route("/keys/:id", get(get_key).delete(revoke_key))
        .route("/keys/:id/topup", post(topup_key))
        .route("/keys/:id/suspend", post(suspend_key))
        .route("/keys/:id/resume", post(resume_key))
        .route("/keys/:id/rotate", post(rotate_key))
        .route("/keys/:id/expiry", put(set_expiry))
        .route("/keys/:id/signing-secret", post(set_signing_secret))
        .route("/keys/bulk/suspend", post(bulk_suspend))
        .route("/groups", post(create_group).get(list_groups))
        .route("/groups/:id", delete(delete_group))
        .route("/maintenance", get(get_maintenance).post(set_maintenance))
        .route("/webhooks", post(set_webhooks))
        .route("/audit", get(get_audit))
        .with_state(state)
        .layer(axum::middleware::from_fn_with_state(config, admin_key_middleware))
}

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    alias: Option<String>,
    #[serde(default)]
    credits: u64,
    #[serde(default)]
    spending_limit: u64,
    namespace: Option<String>,
    group_id: Option<String>,
}

async fn create_key(State(state): State<AdminState>, Json(req): Json<CreateKeyRequest>) -> Result<Json<ApiKey>> {
    let key = state
        .key_store
        .create_key(CreateKeyParams {
            alias: req.alias,
            credits: req.credits,
            spending_limit: req.spending_limit,
            namespace: req.namespace,
            group_id: req.group_id,
        })
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    state.audit_log.log_key_created(&key.masked_prefix(), crate::services::audit_log::Actor::Admin);
    Ok(Json(key))
}

#[derive(Debug, Deserialize)]
struct ListKeysQuery {
    namespace: Option<String>,
}

async fn list_keys(State(state): State<AdminState>, Query(query): Query<ListKeysQuery>) -> Json<Vec<MaskedKey>> {
    Json(state.key_store.list_keys(query.namespace.as_deref()))
}

async fn get_key(State(state): State<AdminState>, Path(id): Path<String>) -> Result<Json<ApiKey>> {
    state.key_store.get_key_raw(&id).map(Json).ok_or_else(|| AppError::NotFound("key not found".to_string()))
}

#[derive(Debug, Deserialize)]
struct TopupRequest {
    credits: u64,
}

async fn topup_key(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(req): Json<TopupRequest>,
) -> Result<Json<ApiKey>> {
    // `refund` just credits the account; top-up reuses the same primitive
    // since both are "add N credits with no charge semantics".
    state
        .key_store
        .refund(&id, req.credits)
        .map(Json)
        .ok_or_else(|| AppError::NotFound("key not found".to_string()))
}

async fn suspend_key(State(state): State<AdminState>, Path(id): Path<String>) -> Result<Json<serde_json::Value>> {
    if !state.key_store.suspend(&id) {
        return Err(AppError::NotFound("key not found".to_string()));
    }
    state.audit_log.log_key_suspended(&id, "admin_requested");
    Ok(Json(serde_json::json!({ "suspended": true })))
}

async fn resume_key(State(state): State<AdminState>, Path(id): Path<String>) -> Result<Json<serde_json::Value>> {
    if !state.key_store.resume(&id) {
        return Err(AppError::NotFound("key not found".to_string()));
    }
    Ok(Json(serde_json::json!({ "resumed": true })))
}

async fn revoke_key(State(state): State<AdminState>, Path(id): Path<String>) -> Result<Json<serde_json::Value>> {
    if !state.key_store.revoke(&id) {
        return Err(AppError::NotFound("key not found".to_string()));
    }
    Ok(Json(serde_json::json!({ "revoked": true })))
}

async fn rotate_key(State(state): State<AdminState>, Path(id): Path<String>) -> Result<Json<ApiKey>> {
    state.key_store.rotate_key(&id).map(Json).ok_or_else(|| AppError::NotFound("key not found".to_string()))
}

#[derive(Debug, Deserialize)]
struct SetExpiryRequest {
    expires_at: Option<DateTime<Utc>>,
}

async fn set_expiry(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(req): Json<SetExpiryRequest>,
) -> Result<Json<serde_json::Value>> {
    if !state.key_store.set_expiry(&id, req.expires_at) {
        return Err(AppError::NotFound("key not found".to_string()));
    }
    Ok(Json(serde_json::json!({ "expiresAt": req.expires_at })))
}

/// Generates and registers a new per-key HMAC secret (§4.6), returning it
/// once in plaintext so the caller can start signing requests with it; it
/// is stored hex-encoded on the key record and never echoed again.
async fn set_signing_secret(State(state): State<AdminState>, Path(id): Path<String>) -> Result<Json<serde_json::Value>> {
    let secret_hex = hex::encode(RequestSigner::generate_secret());
    if !state.key_store.set_signing_secret(&id, Some(secret_hex.clone())) {
        return Err(AppError::NotFound("key not found".to_string()));
    }
    state.audit_log.log(
        "signing_secret_rotated",
        crate::services::audit_log::Actor::Admin,
        Some(id),
        "signing secret generated",
        serde_json::json!({}),
    );
    Ok(Json(serde_json::json!({ "signingSecret": secret_hex })))
}

#[derive(Debug, Deserialize)]
struct BulkSuspendRequest {
    ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct BulkResult {
    succeeded: Vec<String>,
    failed: Vec<String>,
}

async fn bulk_suspend(State(state): State<AdminState>, Json(req): Json<BulkSuspendRequest>) -> Result<Json<BulkResult>> {
    if req.ids.len() > MAX_BULK_OPERATION {
        return Err(AppError::BadRequest(format!("bulk operations are capped at {MAX_BULK_OPERATION} keys")));
    }
    let mut succeeded = Vec::new();
    let mut failed = Vec::new();
    for id in req.ids {
        if state.key_store.suspend(&id) {
            state.audit_log.log_key_suspended(&id, "admin_bulk_requested");
            succeeded.push(id);
        } else {
            failed.push(id);
        }
    }
    Ok(Json(BulkResult { succeeded, failed }))
}

async fn create_group(State(state): State<AdminState>, Json(group): Json<KeyGroup>) -> Json<serde_json::Value> {
    state.key_groups.create_group(group);
    Json(serde_json::json!({ "created": true }))
}

async fn list_groups(State(state): State<AdminState>) -> Json<Vec<KeyGroup>> {
    Json(state.key_groups.list())
}

async fn delete_group(State(state): State<AdminState>, Path(id): Path<String>) -> Json<serde_json::Value> {
    state.key_groups.delete_group(&id);
    Json(serde_json::json!({ "deleted": true }))
}

async fn get_maintenance(State(state): State<AdminState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "maintenanceMode": state.maintenance_mode.load(Ordering::SeqCst) }))
}

#[derive(Debug, Deserialize)]
struct MaintenanceRequest {
    enabled: bool,
}

async fn set_maintenance(State(state): State<AdminState>, Json(req): Json<MaintenanceRequest>) -> Json<serde_json::Value> {
    state.maintenance_mode.store(req.enabled, Ordering::SeqCst);
    Json(serde_json::json!({ "maintenanceMode": req.enabled }))
}

#[derive(Debug, Deserialize)]
struct WebhookFilterRequest {
    url: String,
    event_type: String,
    key_prefix: Option<String>,
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    5
}

async fn set_webhooks(State(state): State<AdminState>, Json(filters): Json<Vec<WebhookFilterRequest>>) -> Json<serde_json::Value> {
    let filters = filters
        .into_iter()
        .map(|f| WebhookFilter { url: f.url, event_type: f.event_type, key_prefix: f.key_prefix, max_attempts: f.max_attempts })
        .collect();
    state.dispatcher.set_webhook_filters(filters).await;
    Json(serde_json::json!({ "registered": true }))
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    since: Option<DateTime<Utc>>,
}

async fn get_audit(State(state): State<AdminState>, Query(query): Query<AuditQuery>) -> Json<Vec<crate::services::audit_log::AuditEvent>> {
    Json(state.audit_log.get_events(query.since))
}
