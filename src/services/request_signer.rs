//! HMAC-SHA256 request signature verification with timestamp tolerance and
//! nonce replay defense (§4.6). HMAC mechanics grounded in the teacher's
//! `webhook_security_service::verify_signature`; constant-time comparison
//! uses `subtle`, which the teacher already depends on for CSRF tokens. The
//! nonce table's capped/pruned DashMap follows `TokenBlacklistService`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

static NONCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{16,64}$").unwrap());
static SIG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{64}$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    Malformed,
    Expired,
    Replayed,
    Mismatch,
}

pub struct RequestSigner {
    enabled: bool,
    tolerance_ms: i64,
    nonce_window_ms: i64,
    nonce_cap: usize,
    nonces: Arc<DashMap<String, DateTime<Utc>>>,
}

impl RequestSigner {
    pub fn new(enabled: bool, tolerance_ms: i64, nonce_window_ms: i64, nonce_cap: usize) -> Self {
        // Nonce window must be at least the tolerance; auto-doubled if misconfigured.
        let nonce_window_ms = if nonce_window_ms < tolerance_ms { tolerance_ms * 2 } else { nonce_window_ms };

        let nonces: Arc<DashMap<String, DateTime<Utc>>> = Arc::new(DashMap::new());
        let sweep_nonces = nonces.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                let now = Utc::now();
                sweep_nonces.retain(|_, observed| (now - *observed).num_milliseconds() < nonce_window_ms);
            }
        });

        Self { enabled, tolerance_ms, nonce_window_ms, nonce_cap, nonces }
    }

    /// `secret` is `None` when no signing secret is registered for the key
    /// (signing is opt-in per key).
    pub fn verify(
        &self,
        secret: Option<&[u8]>,
        header: &str,
        method: &str,
        path: &str,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        if !self.enabled {
            return Ok(());
        }
        let Some(secret) = secret else { return Ok(()) };

        let (timestamp, nonce, sig) = parse_header(header).ok_or(SignatureError::Malformed)?;

        if !NONCE_RE.is_match(&nonce) {
            return Err(SignatureError::Malformed);
        }
        if !SIG_RE.is_match(&sig) {
            return Err(SignatureError::Malformed);
        }
        let ts: i64 = timestamp.parse().map_err(|_| SignatureError::Malformed)?;

        let now_ms = now.timestamp_millis();
        if (now_ms - ts).abs() > self.tolerance_ms {
            return Err(SignatureError::Expired);
        }

        if self.nonces.contains_key(&nonce) {
            return Err(SignatureError::Replayed);
        }

        let body_hash = hex::encode(Sha256::digest(body));
        let payload = format!("{timestamp}.{nonce}.{method}.{path}.{body_hash}");

        let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::Mismatch)?;
        mac.update(payload.as_bytes());
        let expected = mac.finalize().into_bytes();
        let expected_hex = hex::encode(expected);

        if expected_hex.as_bytes().ct_eq(sig.as_bytes()).unwrap_u8() != 1 {
            return Err(SignatureError::Mismatch);
        }

        self.nonces.insert(nonce, now);
        if self.nonces.len() > self.nonce_cap {
            self.evict_oldest();
        }
        Ok(())
    }

    fn evict_oldest(&self) {
        if let Some(oldest_key) = self.nonces.iter().min_by_key(|e| *e.value()).map(|e| e.key().clone()) {
            self.nonces.remove(&oldest_key);
        }
    }

    pub fn generate_secret() -> Vec<u8> {
        use rand::RngCore;
        let mut bytes = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    }
}

fn parse_header(header: &str) -> Option<(String, String, String)> {
    let mut t = None;
    let mut n = None;
    let mut s = None;
    for part in header.split(',') {
        let (key, value) = part.split_once('=')?;
        match key.trim() {
            "t" => t = Some(value.trim().to_string()),
            "n" => n = Some(value.trim().to_string()),
            "s" => s = Some(value.trim().to_string()),
            _ => {}
        }
    }
    Some((t?, n?, s?))
}
