// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Enrollment and operator endpoints for the account pool.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorBody, ErrorResponse, PoolError};
use crate::oauth::client::parse_id_token_claims;
use crate::oauth::{pkce, OAuthError, OAuthTokens};
use crate::plan::{coerce_account_plan_type, DEFAULT_PLAN};
use crate::state::{AppState, PendingAuth};
use crate::store::{epoch_secs, Account, AccountStatus};

/// Pending PKCE enrollments older than this are discarded.
const PENDING_AUTH_TTL_SECS: u64 = 600;

// -- Request/Response types ---------------------------------------------------

#[derive(Debug, Serialize)]
pub struct AccountInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub plan_type: String,
    pub status: AccountStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<f64>,
    pub error_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deactivation_reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OAuthStartResponse {
    pub auth_url: String,
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub struct OAuthCompleteRequest {
    pub state: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct EnrolledResponse {
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub plan_type: String,
}

// -- Handlers -----------------------------------------------------------------

/// `GET /api/v1/accounts` — stored accounts joined with runtime state.
pub async fn list_accounts(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    let accounts = match s.accounts.list().await {
        Ok(accounts) => accounts,
        Err(e) => return PoolError::Internal.to_http_response(e.to_string()).into_response(),
    };
    let runtime = s.balancer.snapshot().await;

    let list: Vec<AccountInfo> = accounts
        .into_iter()
        .map(|account| {
            let state = runtime.iter().find(|st| st.account_id == account.id);
            AccountInfo {
                id: account.id,
                email: account.email,
                plan_type: account.plan_type,
                status: state.map(|st| st.status).unwrap_or(account.status),
                used_percent: state.and_then(|st| st.used_percent),
                reset_at: state.and_then(|st| st.reset_at),
                cooldown_until: state.and_then(|st| st.cooldown_until),
                error_count: state.map(|st| st.error_count).unwrap_or(0),
                deactivation_reason: state
                    .and_then(|st| st.deactivation_reason.clone())
                    .or(account.deactivation_reason),
            }
        })
        .collect();
    Json(list).into_response()
}

/// `POST /api/v1/accounts/oauth/start` — begin a PKCE enrollment.
pub async fn oauth_start(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    let (code_verifier, code_challenge) = pkce::generate_pkce_pair();
    let state_param = pkce::generate_state();
    let auth_url = pkce::build_authorization_url(
        s.oauth.base_url(),
        &s.config.oauth_client_id,
        &s.config.oauth_redirect_uri,
        &s.config.oauth_scope,
        &code_challenge,
        &state_param,
    );

    {
        let mut pending = s.pending_auths.lock().await;
        let now = epoch_secs();
        pending.retain(|_, auth| now.saturating_sub(auth.created_at) < PENDING_AUTH_TTL_SECS);
        pending.insert(state_param.clone(), PendingAuth { code_verifier, created_at: now });
    }

    Json(OAuthStartResponse { auth_url, state: state_param }).into_response()
}

/// `POST /api/v1/accounts/oauth/complete` — finish a PKCE enrollment with the
/// authorization code from the redirect.
pub async fn oauth_complete(
    State(s): State<Arc<AppState>>,
    Json(req): Json<OAuthCompleteRequest>,
) -> impl IntoResponse {
    let pending = s.pending_auths.lock().await.remove(&req.state);
    let Some(pending) = pending else {
        return PoolError::InvalidRequest
            .to_http_response("unknown or expired auth state")
            .into_response();
    };

    let tokens = match s
        .oauth
        .exchange_authorization_code(&req.code, &pending.code_verifier, None, None)
        .await
    {
        Ok(tokens) => tokens,
        Err(e) => return oauth_failure(axum::http::StatusCode::BAD_REQUEST, e),
    };

    match enroll(&s, tokens).await {
        Ok(account) => Json(EnrolledResponse {
            account_id: account.id,
            email: account.email,
            plan_type: account.plan_type,
        })
        .into_response(),
        Err(e) => PoolError::Internal.to_http_response(e.to_string()).into_response(),
    }
}

/// `POST /api/v1/accounts/device/start` — begin a device-code enrollment.
///
/// Returns the verification URL + user code and polls the token endpoint in
/// the background until the user approves or the code expires.
pub async fn device_start(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    let device = match s.oauth.request_device_code(None).await {
        Ok(device) => device,
        Err(e) => return oauth_failure(axum::http::StatusCode::BAD_GATEWAY, e),
    };

    let state = Arc::clone(&s);
    let poll = device.clone();
    tokio::spawn(async move {
        let interval = Duration::from_secs(poll.interval_seconds.max(1));
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(poll.expires_in_seconds.max(1));
        loop {
            tokio::time::sleep(interval).await;
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(user_code = %poll.user_code, "device code expired unapproved");
                break;
            }
            match state
                .oauth
                .exchange_device_token(&poll.device_auth_id, &poll.user_code, None)
                .await
            {
                Ok(None) => continue,
                Ok(Some(tokens)) => {
                    match enroll(&state, tokens).await {
                        Ok(account) => {
                            tracing::info!(account = %account.id, "device enrollment completed")
                        }
                        Err(e) => tracing::warn!(err = %e, "device enrollment failed to persist"),
                    }
                    break;
                }
                Err(e) => {
                    tracing::warn!(err = %e, "device code polling failed");
                    break;
                }
            }
        }
    });

    Json(device).into_response()
}

/// `POST /api/v1/accounts/{id}/pause`
pub async fn pause_account(
    State(s): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    set_account_status(&s, &id, AccountStatus::Paused).await
}

/// `POST /api/v1/accounts/{id}/resume` — the only path out of DEACTIVATED.
pub async fn resume_account(
    State(s): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    set_account_status(&s, &id, AccountStatus::Active).await
}

/// `DELETE /api/v1/accounts/{id}`
pub async fn delete_account(
    State(s): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match s.accounts.delete(&id).await {
        Ok(true) => {
            s.balancer.remove(&id).await;
            tracing::info!(account = %id, "account deleted");
            Json(serde_json::json!({ "id": id, "removed": true })).into_response()
        }
        Ok(false) => {
            PoolError::AccountNotFound.to_http_response("account not found").into_response()
        }
        Err(e) => PoolError::Internal.to_http_response(e.to_string()).into_response(),
    }
}

/// Surface an OAuth failure with its own code (`device_auth_unavailable`,
/// `invalid_response`, ...) instead of a generic pool code.
fn oauth_failure(status: axum::http::StatusCode, e: OAuthError) -> axum::response::Response {
    let body = ErrorResponse {
        error: ErrorBody {
            code: e.code,
            message: e.message,
            plan_type: None,
            resets_at: None,
            resets_in_seconds: None,
        },
    };
    (status, Json(body)).into_response()
}

async fn set_account_status(s: &AppState, id: &str, status: AccountStatus) -> axum::response::Response {
    match s.accounts.update_status(id, status, None).await {
        Ok(true) => {
            s.balancer.set_status(id, status).await;
            tracing::info!(account = %id, status = ?status, "account status updated");
            Json(serde_json::json!({ "id": id, "status": status })).into_response()
        }
        Ok(false) => {
            PoolError::AccountNotFound.to_http_response("account not found").into_response()
        }
        Err(e) => PoolError::Internal.to_http_response(e.to_string()).into_response(),
    }
}

/// Turn a token triple into a stored, balancer-registered account.
///
/// The stable id comes from the id-token claims; accounts the claims cannot
/// identify get a synthetic `local_` id.
pub async fn enroll(state: &AppState, tokens: OAuthTokens) -> anyhow::Result<Account> {
    let claims = parse_id_token_claims(&tokens.id_token);
    let id = claims
        .account_id
        .unwrap_or_else(|| format!("local_{}", uuid::Uuid::new_v4().simple()));
    let existing = state.accounts.get(&id).await?;

    let now = epoch_secs();
    let account = Account {
        id: id.clone(),
        email: claims.email,
        plan_type: coerce_account_plan_type(claims.plan_type.as_deref(), DEFAULT_PLAN),
        access_token_encrypted: state.codec.encrypt(&tokens.access_token)?,
        refresh_token_encrypted: state.codec.encrypt(&tokens.refresh_token)?,
        id_token_encrypted: state.codec.encrypt(&tokens.id_token)?,
        last_refresh: now,
        status: AccountStatus::Active,
        deactivation_reason: None,
        created_at: existing.map(|a| a.created_at).unwrap_or(now),
    };

    state.accounts.upsert(account.clone()).await?;
    state.balancer.register(&account, None).await;
    tracing::info!(account = %account.id, plan = %account.plan_type, "account enrolled");
    Ok(account)
}
