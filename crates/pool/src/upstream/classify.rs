// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Upstream error-envelope parsing and classification.
//!
//! The standard envelope is `{"error": {...}}`, but the inner value is
//! sometimes a bare string and numeric fields arrive as ints, floats, or
//! numeric strings. Everything normalizes into [`UpstreamErrorInfo`].

use serde::Deserialize;
use serde_json::Value;

use crate::balancer::permanent_failure_reason;

/// Codes that mean "this account's quota is gone until the window resets".
const QUOTA_CODES: &[&str] = &["quota_exceeded", "insufficient_quota"];

/// Codes that mean "rate limited" even off a 429 status.
const RATE_LIMIT_CODES: &[&str] = &["rate_limit_exceeded", "rate_limited"];

/// Parsed upstream failure with the metadata the balancer and the downstream
/// envelope both need.
#[derive(Debug, Clone)]
pub struct UpstreamErrorInfo {
    pub code: String,
    pub message: String,
    pub http_status: u16,
    pub plan_type: Option<String>,
    pub resets_at: Option<f64>,
    pub resets_in_seconds: Option<f64>,
}

/// What the router should do about a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 401: refresh once and retry the same account.
    Unauthorized,
    /// Cooldown the account and try another.
    RateLimited,
    /// Quota exhausted until the window resets; try another account.
    QuotaExceeded,
    /// Deactivate the account; try another.
    PermanentAuth,
    /// 5xx noise; count the error and try another account.
    Transient,
    /// Surface verbatim.
    Other,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    error: Option<ErrorField>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorField {
    Text(String),
    Structured(ErrorDetails),
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetails {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    error_type: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    plan_type: Option<String>,
    #[serde(default)]
    resets_at: Option<Value>,
    #[serde(default)]
    resets_in_seconds: Option<Value>,
}

/// Accept int, float, or numeric string.
fn coerce_number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn normalize_error_code(code: Option<&str>, error_type: Option<&str>) -> String {
    code.or(error_type).map(str::to_lowercase).unwrap_or_else(|| "upstream_error".to_owned())
}

/// Parse an upstream error body. Unparseable bodies degrade to
/// `upstream_error` with the status-line message.
pub fn parse_error_body(http_status: u16, body: &[u8]) -> UpstreamErrorInfo {
    let fallback_message = || format!("Upstream request failed ({http_status})");

    let details = match serde_json::from_slice::<Envelope>(body) {
        Ok(Envelope { error: Some(ErrorField::Structured(details)) }) => details,
        Ok(Envelope { error: Some(ErrorField::Text(text)) }) => {
            ErrorDetails { message: Some(text), ..ErrorDetails::default() }
        }
        _ => {
            let text = String::from_utf8_lossy(body).trim().to_owned();
            ErrorDetails {
                message: (!text.is_empty()).then_some(text),
                ..ErrorDetails::default()
            }
        }
    };

    UpstreamErrorInfo {
        code: normalize_error_code(details.code.as_deref(), details.error_type.as_deref()),
        message: details.message.unwrap_or_else(fallback_message),
        http_status,
        plan_type: details.plan_type,
        resets_at: coerce_number(details.resets_at.as_ref()),
        resets_in_seconds: coerce_number(details.resets_in_seconds.as_ref()),
    }
}

/// Map a parsed failure to the router's recovery action.
pub fn classify(info: &UpstreamErrorInfo) -> ErrorClass {
    if permanent_failure_reason(&info.code).is_some() {
        return ErrorClass::PermanentAuth;
    }
    if QUOTA_CODES.contains(&info.code.as_str()) {
        return ErrorClass::QuotaExceeded;
    }
    if info.http_status == 429 || RATE_LIMIT_CODES.contains(&info.code.as_str()) {
        return ErrorClass::RateLimited;
    }
    if info.http_status == 401 {
        return ErrorClass::Unauthorized;
    }
    if info.http_status >= 500 {
        return ErrorClass::Transient;
    }
    ErrorClass::Other
}
