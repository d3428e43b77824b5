// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Usage sampling: pulls per-account usage from upstream, records window
//! rows, and feeds the balancer's usage-driven transitions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::auth::AuthManager;
use crate::balancer::{now_epoch, Balancer, UsageSample};
use crate::crypto::TokenCodec;
use crate::store::{epoch_secs, Account, AccountStatus, AccountsRepo, UsageRecord, UsageRepo};

// -- Upstream payload ----------------------------------------------------------

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct UsageWindow {
    #[serde(default)]
    pub used_percent: Option<f64>,
    #[serde(default)]
    pub limit_window_seconds: Option<i64>,
    #[serde(default)]
    pub reset_at: Option<i64>,
    #[serde(default)]
    pub reset_after_seconds: Option<i64>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct UsageRateLimit {
    #[serde(default)]
    pub primary_window: Option<UsageWindow>,
    #[serde(default)]
    pub secondary_window: Option<UsageWindow>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct UsageCredits {
    #[serde(default)]
    pub has_credits: Option<bool>,
    #[serde(default)]
    pub unlimited: Option<bool>,
    /// Number or numeric string upstream, depending on plan.
    #[serde(default)]
    pub balance: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct UsagePayload {
    #[serde(default)]
    pub plan_type: Option<String>,
    #[serde(default)]
    pub rate_limit: Option<UsageRateLimit>,
    #[serde(default)]
    pub credits: Option<UsageCredits>,
}

#[derive(Debug, Clone)]
pub struct UsageFetchError {
    pub status: Option<u16>,
    pub message: String,
}

impl fmt::Display for UsageFetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "usage fetch failed ({status}): {}", self.message),
            None => write!(f, "usage fetch failed: {}", self.message),
        }
    }
}

impl std::error::Error for UsageFetchError {}

/// Capability seam over the usage HTTP call.
#[async_trait::async_trait]
pub trait UsageFetcher: Send + Sync {
    async fn fetch_usage(
        &self,
        access_token: &str,
        account_id: &str,
    ) -> Result<UsagePayload, UsageFetchError>;
}

pub struct HttpUsageFetcher {
    http: reqwest::Client,
    base_url: String,
}

impl HttpUsageFetcher {
    pub fn new(api_base_url: &str) -> Self {
        crate::crypto::ensure_rustls_provider();
        Self { http: reqwest::Client::new(), base_url: api_base_url.trim_end_matches('/').to_owned() }
    }
}

#[async_trait::async_trait]
impl UsageFetcher for HttpUsageFetcher {
    async fn fetch_usage(
        &self,
        access_token: &str,
        account_id: &str,
    ) -> Result<UsagePayload, UsageFetchError> {
        let url = format!("{}/usage", self.base_url);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .header("chatgpt-account-id", account_id)
            .send()
            .await
            .map_err(|e| UsageFetchError { status: None, message: e.to_string() })?;

        let status = resp.status().as_u16();
        if status >= 400 {
            let body = resp.text().await.unwrap_or_default();
            return Err(UsageFetchError { status: Some(status), message: body });
        }
        resp.json::<UsagePayload>()
            .await
            .map_err(|e| UsageFetchError { status: None, message: e.to_string() })
    }
}

// -- Helpers -------------------------------------------------------------------

/// `ceil(limit_window_seconds / 60)`, clamped to at least one minute.
pub fn window_minutes(limit_window_seconds: Option<i64>) -> Option<i64> {
    let seconds = limit_window_seconds?;
    if seconds <= 0 {
        return None;
    }
    Some(((seconds + 59) / 60).max(1))
}

/// Extract the credits triple from a payload.
pub fn credits_snapshot(payload: &UsagePayload) -> (Option<bool>, Option<bool>, Option<f64>) {
    let Some(credits) = &payload.credits else {
        return (None, None, None);
    };
    (credits.has_credits, credits.unlimited, parse_credits_balance(credits.balance.as_ref()))
}

fn parse_credits_balance(value: Option<&serde_json::Value>) -> Option<f64> {
    match value? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// -- Updater -------------------------------------------------------------------

pub struct UsageUpdater {
    usage_repo: Arc<dyn UsageRepo>,
    codec: Arc<TokenCodec>,
    fetcher: Arc<dyn UsageFetcher>,
    auth: Option<Arc<AuthManager>>,
    balancer: Arc<Balancer>,
    enabled: bool,
    interval_seconds: u64,
}

impl UsageUpdater {
    pub fn new(
        usage_repo: Arc<dyn UsageRepo>,
        codec: Arc<TokenCodec>,
        fetcher: Arc<dyn UsageFetcher>,
        auth: Option<Arc<AuthManager>>,
        balancer: Arc<Balancer>,
        enabled: bool,
        interval_seconds: u64,
    ) -> Self {
        Self { usage_repo, codec, fetcher, auth, balancer, enabled, interval_seconds }
    }

    /// Sample usage for every account that is due. Per-account failures are
    /// contained; the loop always visits every account.
    pub async fn refresh_accounts(
        &self,
        accounts: &[Account],
        latest_usage: &HashMap<String, UsageRecord>,
    ) {
        if !self.enabled {
            return;
        }
        let now = epoch_secs();
        for account in accounts {
            if account.status == AccountStatus::Deactivated {
                continue;
            }
            if let Some(latest) = latest_usage.get(&account.id) {
                if now.saturating_sub(latest.recorded_at) < self.interval_seconds {
                    continue;
                }
            }
            if let Err(e) = self.refresh_account(account).await {
                tracing::warn!(account = %account.id, err = %e, "usage refresh failed");
            }
        }
    }

    async fn refresh_account(&self, account: &Account) -> anyhow::Result<()> {
        let access_token = self.codec.decrypt(&account.access_token_encrypted)?;
        let payload = match self.fetcher.fetch_usage(&access_token, &account.id).await {
            Ok(payload) => payload,
            Err(e) if e.status == Some(401) && self.auth.is_some() => {
                // Stale token: force one refresh and retry, then give up.
                let Some(auth) = &self.auth else { return Ok(()) };
                let Ok(refreshed) = auth.ensure_fresh(account, true).await else {
                    return Ok(());
                };
                let access_token = self.codec.decrypt(&refreshed.access_token_encrypted)?;
                match self.fetcher.fetch_usage(&access_token, &refreshed.id).await {
                    Ok(payload) => payload,
                    Err(_) => return Ok(()),
                }
            }
            Err(e) => {
                tracing::debug!(account = %account.id, err = %e, "usage fetch failed");
                return Ok(());
            }
        };

        let rate_limit = payload.rate_limit.clone().unwrap_or_default();
        let primary = rate_limit.primary_window.unwrap_or_default();
        let secondary = rate_limit.secondary_window;
        let (credits_has, credits_unlimited, credits_balance) = credits_snapshot(&payload);
        let primary_minutes = window_minutes(primary.limit_window_seconds);
        let recorded_at = epoch_secs();

        if let Some(used_percent) = primary.used_percent {
            self.usage_repo
                .add_entry(UsageRecord {
                    account_id: account.id.clone(),
                    window: Some("primary".to_owned()),
                    used_percent,
                    reset_at: primary.reset_at,
                    window_minutes: primary_minutes,
                    input_tokens: None,
                    output_tokens: None,
                    credits_has,
                    credits_unlimited,
                    credits_balance,
                    recorded_at,
                })
                .await?;
        }

        if let Some(secondary) = &secondary {
            if let Some(used_percent) = secondary.used_percent {
                self.usage_repo
                    .add_entry(UsageRecord {
                        account_id: account.id.clone(),
                        window: Some("secondary".to_owned()),
                        used_percent,
                        reset_at: secondary.reset_at,
                        window_minutes: window_minutes(secondary.limit_window_seconds),
                        input_tokens: None,
                        output_tokens: None,
                        credits_has: None,
                        credits_unlimited: None,
                        credits_balance: None,
                        recorded_at,
                    })
                    .await?;
            }
        }

        let sample = UsageSample {
            primary_used: primary.used_percent,
            primary_reset: primary.reset_at.map(|v| v as f64),
            primary_window_minutes: primary_minutes,
            secondary_used: secondary.as_ref().and_then(|w| w.used_percent),
            secondary_reset: secondary.as_ref().and_then(|w| w.reset_at).map(|v| v as f64),
        };
        self.balancer.apply_usage(&account.id, &sample, now_epoch()).await;
        Ok(())
    }
}

/// Spawn the background loop that drives the updater until shutdown.
pub fn spawn_usage_loop(
    accounts_repo: Arc<dyn AccountsRepo>,
    usage_repo: Arc<dyn UsageRepo>,
    updater: Arc<UsageUpdater>,
    every: std::time::Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(every);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {}
            }

            let accounts = match accounts_repo.list().await {
                Ok(accounts) => accounts,
                Err(e) => {
                    tracing::warn!(err = %e, "failed to list accounts for usage refresh");
                    continue;
                }
            };
            let latest = match usage_repo.latest_by_account(Some("primary")).await {
                Ok(latest) => latest,
                Err(e) => {
                    tracing::warn!(err = %e, "failed to load latest usage");
                    continue;
                }
            };
            updater.refresh_accounts(&accounts, &latest).await;
        }
    });
}

#[cfg(test)]
#[path = "usage_tests.rs"]
mod tests;
