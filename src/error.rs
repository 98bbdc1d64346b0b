//! Error taxonomy (§7) and the `AppError` type used for transport/framework
//! level failures. Detailed errors are logged server-side only; clients get
//! a sanitized token, mirroring the teacher's `error_handling` policy.

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Deny-reason vocabulary threaded through `GateDecision` and usage events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    InvalidApiKey,
    ApiKeyExpired,
    ApiKeyRevoked,
    ApiKeySuspended,
    ToolNotAllowed,
    ToolDenied,
    CountryBlocked,
    IpBlocked,
    SignatureInvalid,
    SignatureExpired,
    NonceReplayed,
    InsufficientCredits,
    SpendingLimitExceeded,
    DailyCalls,
    MonthlyCalls,
    DailyCredits,
    MonthlyCredits,
    ServerDailyCreditCap,
    ServerDailyCallCap,
    HourlyCallCap,
    HourlyCreditCap,
    RateLimited,
    CircuitOpen,
    BackendTimeout,
    BackendError,
}

impl DenyReason {
    pub fn as_token(&self) -> &'static str {
        match self {
            DenyReason::InvalidApiKey => "invalid_api_key",
            DenyReason::ApiKeyExpired => "api_key_expired",
            DenyReason::ApiKeyRevoked => "api_key_revoked",
            DenyReason::ApiKeySuspended => "api_key_suspended",
            DenyReason::ToolNotAllowed => "tool_not_allowed",
            DenyReason::ToolDenied => "tool_denied",
            DenyReason::CountryBlocked => "country_blocked",
            DenyReason::IpBlocked => "ip_blocked",
            DenyReason::SignatureInvalid => "signature_invalid",
            DenyReason::SignatureExpired => "signature_expired",
            DenyReason::NonceReplayed => "nonce_replayed",
            DenyReason::InsufficientCredits => "insufficient_credits",
            DenyReason::SpendingLimitExceeded => "spending_limit_exceeded",
            DenyReason::DailyCalls => "daily_calls",
            DenyReason::MonthlyCalls => "monthly_calls",
            DenyReason::DailyCredits => "daily_credits",
            DenyReason::MonthlyCredits => "monthly_credits",
            DenyReason::ServerDailyCreditCap => "server_daily_credit_cap",
            DenyReason::ServerDailyCallCap => "server_daily_call_cap",
            DenyReason::HourlyCallCap => "hourly_call_cap",
            DenyReason::HourlyCreditCap => "hourly_credit_cap",
            DenyReason::RateLimited => "rate_limited",
            DenyReason::CircuitOpen => "circuit_open",
            DenyReason::BackendTimeout => "backend_timeout",
            DenyReason::BackendError => "backend_error",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}

/// JSON-RPC 2.0 error codes used on the wire.
pub mod jsonrpc_code {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Billing-denial family, per spec §6: `Payment required: <reason>`.
    pub const PAYMENT_REQUIRED: i64 = -32402;
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("payment required: {0}")]
    Billing(DenyReason),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("request too large")]
    PayloadTooLarge,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            AppError::Billing(r) => Some(*r),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Billing(reason) => {
                let body = ErrorBody {
                    error: format!("Payment required: {}", reason.as_token()),
                };
                (StatusCode::PAYMENT_REQUIRED, axum::Json(body)).into_response()
            }
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, axum::Json(ErrorBody { error: msg.clone() })).into_response()
            }
            AppError::PayloadTooLarge => {
                (StatusCode::PAYLOAD_TOO_LARGE, axum::Json(ErrorBody {
                    error: "request body exceeds the configured limit".to_string(),
                }))
                    .into_response()
            }
            AppError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, axum::Json(ErrorBody { error: msg.clone() })).into_response()
            }
            AppError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, axum::Json(ErrorBody { error: "unauthorized".to_string() }))
                    .into_response()
            }
            AppError::Internal(err) => {
                tracing::error!(error = %err, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    axum::Json(ErrorBody { error: "internal_error".to_string() }),
                )
                    .into_response()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
