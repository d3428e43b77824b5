// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Refresh-on-demand token management.
//!
//! At most one refresh per account is ever in flight: callers serialize on a
//! per-account lock and re-check freshness after acquiring it, so whoever
//! waited behind a refresh reuses its result instead of starting another.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::balancer::permanent_failure_reason;
use crate::crypto::TokenCodec;
use crate::oauth::client::{OAuthClient, RefreshedTokens};
use crate::oauth::OAuthError;
use crate::plan::{coerce_account_plan_type, DEFAULT_PLAN};
use crate::store::{epoch_secs, Account, AccountStatus, AccountsRepo};

/// A failed refresh, classified. Permanent failures have already deactivated
/// the account by the time the error surfaces.
#[derive(Debug, Clone)]
pub struct RefreshFailure {
    pub code: String,
    pub message: String,
    pub permanent: bool,
}

impl fmt::Display for RefreshFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RefreshFailure {}

/// Capability seam over the refresh HTTP call.
#[async_trait::async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(
        &self,
        refresh_token: &str,
        request_id: Option<&str>,
    ) -> Result<RefreshedTokens, OAuthError>;
}

#[async_trait::async_trait]
impl TokenRefresher for OAuthClient {
    async fn refresh(
        &self,
        refresh_token: &str,
        request_id: Option<&str>,
    ) -> Result<RefreshedTokens, OAuthError> {
        self.refresh_access_token(refresh_token, request_id).await
    }
}

/// Whether a token refreshed at `last_refresh` is due again.
pub fn should_refresh(last_refresh: u64, ttl_seconds: u64, now: u64) -> bool {
    now.saturating_sub(last_refresh) > ttl_seconds
}

pub struct AuthManager {
    repo: Arc<dyn AccountsRepo>,
    codec: Arc<TokenCodec>,
    refresher: Arc<dyn TokenRefresher>,
    ttl_seconds: u64,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AuthManager {
    pub fn new(
        repo: Arc<dyn AccountsRepo>,
        codec: Arc<TokenCodec>,
        refresher: Arc<dyn TokenRefresher>,
        ttl_seconds: u64,
    ) -> Self {
        Self { repo, codec, refresher, ttl_seconds, locks: Mutex::new(HashMap::new()) }
    }

    async fn account_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(account_id.to_owned()).or_default())
    }

    /// Return the account with a fresh access token, refreshing if due.
    pub async fn ensure_fresh(
        &self,
        account: &Account,
        force: bool,
    ) -> Result<Account, RefreshFailure> {
        if !force && !should_refresh(account.last_refresh, self.ttl_seconds, epoch_secs()) {
            return Ok(account.clone());
        }
        self.refresh_account(account, force).await
    }

    /// Refresh the account's tokens, persisting the new triple.
    pub async fn refresh_account(
        &self,
        account: &Account,
        force: bool,
    ) -> Result<Account, RefreshFailure> {
        let lock = self.account_lock(&account.id).await;
        let _guard = lock.lock().await;

        // Re-read after acquiring: a refresh we waited behind already did the
        // work, for the forced case too.
        let mut current = match self.repo.get(&account.id).await {
            Ok(Some(current)) => current,
            Ok(None) => account.clone(),
            Err(e) => {
                return Err(RefreshFailure {
                    code: "store_error".to_owned(),
                    message: e.to_string(),
                    permanent: false,
                })
            }
        };
        if current.last_refresh > account.last_refresh
            || (!force && !should_refresh(current.last_refresh, self.ttl_seconds, epoch_secs()))
        {
            return Ok(current);
        }

        let refresh_token = match self.codec.decrypt(&current.refresh_token_encrypted) {
            Ok(token) => token,
            Err(e) => {
                // Undecryptable refresh token can never heal on its own.
                let reason = "Stored refresh token unreadable; sign in again";
                let _ = self
                    .repo
                    .update_status(&current.id, AccountStatus::Deactivated, Some(reason))
                    .await;
                return Err(RefreshFailure {
                    code: "token_decrypt_failed".to_owned(),
                    message: e.to_string(),
                    permanent: true,
                });
            }
        };

        let result = match self.refresher.refresh(&refresh_token, None).await {
            Ok(result) => result,
            Err(e) => return Err(self.settle_failure(&current, e).await),
        };

        let encrypt = |value: &str| {
            self.codec.encrypt(value).map_err(|e| RefreshFailure {
                code: "token_encrypt_failed".to_owned(),
                message: e.to_string(),
                permanent: false,
            })
        };
        current.access_token_encrypted = encrypt(&result.tokens.access_token)?;
        current.refresh_token_encrypted = encrypt(&result.tokens.refresh_token)?;
        current.id_token_encrypted = encrypt(&result.tokens.id_token)?;
        current.last_refresh = epoch_secs();

        if let Some(plan) = result.claims.plan_type.as_deref() {
            let fallback = if current.plan_type.is_empty() {
                DEFAULT_PLAN.to_owned()
            } else {
                current.plan_type.clone()
            };
            current.plan_type = coerce_account_plan_type(Some(plan), &fallback);
        } else if current.plan_type.is_empty() {
            current.plan_type = DEFAULT_PLAN.to_owned();
        }
        if let Some(email) = result.claims.email.clone() {
            current.email = Some(email);
        }

        let persisted = self
            .repo
            .update_tokens(
                &current.id,
                current.access_token_encrypted.clone(),
                current.refresh_token_encrypted.clone(),
                current.id_token_encrypted.clone(),
                current.last_refresh,
                Some(&current.plan_type),
                current.email.as_deref(),
            )
            .await;
        if let Err(e) = persisted {
            tracing::warn!(account = %current.id, err = %e, "failed to persist refreshed tokens");
        }

        tracing::info!(account = %current.id, "tokens refreshed");
        Ok(current)
    }

    async fn settle_failure(&self, account: &Account, error: OAuthError) -> RefreshFailure {
        match permanent_failure_reason(&error.code) {
            Some(reason) => {
                if let Err(e) = self
                    .repo
                    .update_status(&account.id, AccountStatus::Deactivated, Some(reason))
                    .await
                {
                    tracing::warn!(account = %account.id, err = %e, "failed to persist deactivation");
                }
                tracing::warn!(account = %account.id, code = %error.code, "refresh failed permanently");
                RefreshFailure { code: error.code, message: error.message, permanent: true }
            }
            None => {
                tracing::debug!(account = %account.id, code = %error.code, "refresh failed, transient");
                RefreshFailure { code: error.code, message: error.message, permanent: false }
            }
        }
    }
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
