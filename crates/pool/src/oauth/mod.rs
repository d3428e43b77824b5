// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OAuth enrollment and refresh against the upstream identity service.
//!
//! Two flows populate the pool: authorization code + PKCE (browser) and the
//! device-code flow (headless). Both end in the same token triple.

pub mod client;
pub mod pkce;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Structured OAuth failure: machine code, human message, upstream status.
#[derive(Debug, Clone)]
pub struct OAuthError {
    pub code: String,
    pub message: String,
    pub status: Option<u16>,
}

impl OAuthError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, status: Option<u16>) -> Self {
        Self { code: code.into(), message: message.into(), status }
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new("invalid_response", message, None)
    }
}

impl fmt::Display for OAuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for OAuthError {}

/// The mandatory token triple produced by every successful flow.
#[derive(Debug, Clone)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub id_token: String,
}

/// A pending device-code authorization, shown to the operator.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceCode {
    pub verification_url: String,
    pub user_code: String,
    pub device_auth_id: String,
    pub interval_seconds: u64,
    pub expires_in_seconds: u64,
}

/// The `error` field of identity-service payloads is sometimes a bare string
/// and sometimes a structured object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ErrorField {
    Text(String),
    Structured(StructuredError),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StructuredError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Token endpoint response body, shared by all flows. Success and error
/// shapes overlap, so everything is optional and interpreted afterwards.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenPayload {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub error: Option<ErrorField>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Device-token responses may hand back an authorization code to finish
    /// through the regular code exchange.
    #[serde(default)]
    pub authorization_code: Option<String>,
    #[serde(default)]
    pub code_verifier: Option<String>,
}

impl TokenPayload {
    pub fn error_code(&self) -> Option<String> {
        match &self.error {
            Some(ErrorField::Structured(err)) => err.code.clone().or_else(|| err.error.clone()),
            Some(ErrorField::Text(text)) => Some(text.clone()),
            None => self.error_code.clone().or_else(|| self.code.clone()),
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match &self.error {
            Some(ErrorField::Structured(err)) => {
                err.message.clone().or_else(|| err.error_description.clone())
            }
            Some(ErrorField::Text(text)) => {
                self.error_description.clone().or_else(|| Some(text.clone()))
            }
            None => self.message.clone(),
        }
    }

    /// Whether the payload signals "user has not finished authorizing yet".
    pub fn is_pending(&self) -> bool {
        if matches!(self.error_code().as_deref(), Some("authorization_pending" | "slow_down")) {
            return true;
        }
        matches!(
            self.status.as_deref().map(str::to_lowercase).as_deref(),
            Some("pending" | "authorization_pending")
        )
    }

    /// Build an [`OAuthError`], synthesizing `http_<status>` when the payload
    /// carries no code of its own.
    pub fn to_error(&self, status: u16) -> OAuthError {
        let code = self.error_code().unwrap_or_else(|| format!("http_{status}"));
        let message =
            self.error_message().unwrap_or_else(|| format!("OAuth request failed ({status})"));
        OAuthError::new(code, message, Some(status))
    }

    /// Extract the mandatory token triple, or `invalid_response`.
    pub fn into_tokens(self) -> Result<OAuthTokens, OAuthError> {
        match (self.access_token, self.refresh_token, self.id_token) {
            (Some(access_token), Some(refresh_token), Some(id_token))
                if !access_token.is_empty() && !refresh_token.is_empty() =>
            {
                Ok(OAuthTokens { access_token, refresh_token, id_token })
            }
            _ => Err(OAuthError::invalid_response("OAuth response missing tokens")),
        }
    }
}

/// Device usercode endpoint response body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceCodePayload {
    #[serde(default)]
    pub user_code: Option<String>,
    #[serde(default)]
    pub device_auth_id: Option<String>,
    #[serde(default)]
    pub interval: Option<u64>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// RFC 3339 alternative to `expires_in`.
    #[serde(default)]
    pub expires_at: Option<String>,
}
