// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP client for the identity service: code exchange, device flow, refresh.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::config::PoolConfig;
use crate::oauth::{DeviceCode, DeviceCodePayload, OAuthError, OAuthTokens, TokenPayload};

/// Default device-code lifetime when upstream declares none.
const DEFAULT_DEVICE_EXPIRES_IN: u64 = 900;

/// Claims of interest inside the id token.
#[derive(Debug, Clone, Default)]
pub struct IdTokenClaims {
    pub account_id: Option<String>,
    pub email: Option<String>,
    pub plan_type: Option<String>,
}

/// A refresh result: the new token triple plus identity claims.
#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub tokens: OAuthTokens,
    pub claims: IdTokenClaims,
}

pub struct OAuthClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    redirect_uri: String,
    timeout: Duration,
}

impl OAuthClient {
    pub fn new(config: &PoolConfig) -> Self {
        crate::crypto::ensure_rustls_provider();
        Self {
            http: reqwest::Client::new(),
            base_url: config.auth_base_url.trim_end_matches('/').to_owned(),
            client_id: config.oauth_client_id.clone(),
            redirect_uri: config.oauth_redirect_uri.clone(),
            timeout: config.oauth_timeout(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(
        &self,
        builder: reqwest::RequestBuilder,
        request_id: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let builder = builder.timeout(self.timeout);
        match request_id {
            Some(id) => builder.header("x-request-id", id),
            None => builder,
        }
    }

    /// Exchange an authorization code for the token triple.
    pub async fn exchange_authorization_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: Option<&str>,
        request_id: Option<&str>,
    ) -> Result<OAuthTokens, OAuthError> {
        let url = format!("{}/oauth/token", self.base_url);
        let redirect_uri = redirect_uri.unwrap_or(&self.redirect_uri);
        let form = [
            ("grant_type", "authorization_code"),
            ("client_id", self.client_id.as_str()),
            ("code", code),
            ("code_verifier", code_verifier),
            ("redirect_uri", redirect_uri),
        ];

        let resp = self
            .request(self.http.post(&url).form(&form), request_id)
            .send()
            .await
            .map_err(network_error)?;
        let status = resp.status().as_u16();
        let payload = safe_token_payload(resp).await;
        if status >= 400 {
            tracing::warn!(status, "OAuth token request failed");
            return Err(payload.to_error(status));
        }
        payload.into_tokens()
    }

    /// Request a device code for headless enrollment.
    ///
    /// A 404 means the server has no device-auth support at all; that is
    /// surfaced as `device_auth_unavailable` for the operator.
    pub async fn request_device_code(
        &self,
        request_id: Option<&str>,
    ) -> Result<DeviceCode, OAuthError> {
        let url = format!("{}/api/accounts/deviceauth/usercode", self.base_url);
        let body = serde_json::json!({ "client_id": self.client_id });

        let resp = self
            .request(self.http.post(&url).json(&body), request_id)
            .send()
            .await
            .map_err(network_error)?;
        let status = resp.status().as_u16();
        if status >= 400 {
            if status == 404 {
                return Err(OAuthError::new(
                    "device_auth_unavailable",
                    "Device code login is not enabled for this Codex server. \
                     Use the browser login or verify the server URL.",
                    Some(status),
                ));
            }
            tracing::warn!(status, "device auth request failed");
            return Err(OAuthError::new(
                "device_auth_failed",
                format!("Device code request failed with status {status}"),
                Some(status),
            ));
        }

        let payload: DeviceCodePayload = resp
            .json()
            .await
            .map_err(|_| OAuthError::invalid_response("Device auth response invalid"))?;
        let (Some(user_code), Some(device_auth_id)) = (payload.user_code, payload.device_auth_id)
        else {
            return Err(OAuthError::invalid_response("Device auth response missing fields"));
        };
        let expires_in = match payload.expires_in {
            Some(secs) if secs > 0 => secs as u64,
            _ => DEFAULT_DEVICE_EXPIRES_IN,
        };

        Ok(DeviceCode {
            verification_url: format!("{}/codex/device", self.base_url),
            user_code,
            device_auth_id,
            interval_seconds: payload.interval.unwrap_or(0),
            expires_in_seconds: expires_in,
        })
    }

    /// Poll the device token endpoint once. `Ok(None)` means "keep polling".
    pub async fn exchange_device_token(
        &self,
        device_auth_id: &str,
        user_code: &str,
        request_id: Option<&str>,
    ) -> Result<Option<OAuthTokens>, OAuthError> {
        let url = format!("{}/api/accounts/deviceauth/token", self.base_url);
        let body = serde_json::json!({
            "device_auth_id": device_auth_id,
            "user_code": user_code,
        });

        let resp = self
            .request(self.http.post(&url).json(&body), request_id)
            .send()
            .await
            .map_err(network_error)?;
        let status = resp.status().as_u16();
        let payload = safe_token_payload(resp).await;

        if status == 403 || status == 404 {
            return Ok(None);
        }
        if status >= 400 {
            if payload.is_pending() {
                return Ok(None);
            }
            tracing::warn!(status, "device token request failed");
            return Err(payload.to_error(status));
        }
        if payload.is_pending() {
            return Ok(None);
        }

        // Some servers finish the device flow by handing back an
        // authorization code for the regular exchange.
        if let Some(authorization_code) = payload.authorization_code.clone() {
            let Some(code_verifier) = payload.code_verifier.clone() else {
                return Err(OAuthError::invalid_response(
                    "Device auth response missing code verifier",
                ));
            };
            let redirect_uri = format!("{}/deviceauth/callback", self.base_url);
            let tokens = self
                .exchange_authorization_code(
                    &authorization_code,
                    &code_verifier,
                    Some(&redirect_uri),
                    request_id,
                )
                .await?;
            return Ok(Some(tokens));
        }

        payload.into_tokens().map(Some)
    }

    /// Refresh the token triple and re-read identity claims from the id token.
    pub async fn refresh_access_token(
        &self,
        refresh_token: &str,
        request_id: Option<&str>,
    ) -> Result<RefreshedTokens, OAuthError> {
        let url = format!("{}/oauth/token", self.base_url);
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];

        let resp = self
            .request(self.http.post(&url).form(&form), request_id)
            .send()
            .await
            .map_err(network_error)?;
        let status = resp.status().as_u16();
        let payload = safe_token_payload(resp).await;
        if status >= 400 {
            tracing::warn!(status, "token refresh failed");
            return Err(payload.to_error(status));
        }

        let tokens = payload.into_tokens()?;
        let claims = parse_id_token_claims(&tokens.id_token);
        Ok(RefreshedTokens { tokens, claims })
    }
}

fn network_error(err: reqwest::Error) -> OAuthError {
    OAuthError::new("network_error", err.to_string(), None)
}

/// Read the body as a [`TokenPayload`], degrading non-JSON bodies to an error
/// payload carrying the raw text as the message.
async fn safe_token_payload(resp: reqwest::Response) -> TokenPayload {
    let text = resp.text().await.unwrap_or_default();
    serde_json::from_str(&text).unwrap_or_else(|_| TokenPayload {
        message: Some(text.trim().to_owned()),
        ..TokenPayload::default()
    })
}

/// Decode the claims segment of a JWT without verifying the signature.
/// Identity is asserted by the token endpoint we just spoke to; the claims
/// are only used for display and account keying.
pub fn parse_id_token_claims(id_token: &str) -> IdTokenClaims {
    let Some(segment) = id_token.split('.').nth(1) else {
        return IdTokenClaims::default();
    };
    let Ok(decoded) = URL_SAFE_NO_PAD.decode(segment.trim_end_matches('=')) else {
        return IdTokenClaims::default();
    };
    let Ok(claims) = serde_json::from_slice::<serde_json::Value>(&decoded) else {
        return IdTokenClaims::default();
    };

    let auth = claims.get("https://api.openai.com/auth");
    let auth_str =
        |key: &str| auth.and_then(|a| a.get(key)).and_then(|v| v.as_str()).map(str::to_owned);

    IdTokenClaims {
        account_id: auth_str("chatgpt_account_id"),
        email: claims.get("email").and_then(|v| v.as_str()).map(str::to_owned),
        plan_type: auth_str("chatgpt_plan_type"),
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
