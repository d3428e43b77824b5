// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Account balancer: per-account runtime state, quota-aware selection, and
//! the transitions driven by classified upstream errors.
//!
//! Transitions are written as pure functions over [`AccountState`] so their
//! laws are testable without the async shell; [`Balancer`] wraps them in a
//! coarse map lock plus one mutex per account.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use tokio::sync::{Mutex, RwLock};

use crate::store::{Account, AccountStatus};

/// Refresh failure codes that permanently deactivate an account, with the
/// operator-readable reason recorded on deactivation.
const PERMANENT_FAILURE_CODES: &[(&str, &str)] = &[
    ("refresh_token_expired", "Refresh token expired; sign in again"),
    ("refresh_token_revoked", "Refresh token revoked; sign in again"),
    ("invalid_grant", "Refresh token rejected (invalid_grant); sign in again"),
    ("invalid_client", "OAuth client rejected (invalid_client)"),
    ("unauthorized_client", "OAuth client not authorized for this account"),
    ("account_deactivated", "Account deactivated upstream"),
];

/// Reason string for a permanent failure code, if the code is permanent.
pub fn permanent_failure_reason(code: &str) -> Option<&'static str> {
    PERMANENT_FAILURE_CODES.iter().find(|(c, _)| *c == code).map(|(_, reason)| *reason)
}

/// In-memory runtime projection of one account.
#[derive(Debug, Clone)]
pub struct AccountState {
    pub account_id: String,
    pub status: AccountStatus,
    /// Latest primary-window sample, 0..100.
    pub used_percent: Option<f64>,
    /// Upstream-declared end of the current rate window (epoch seconds).
    pub reset_at: Option<f64>,
    /// Locally decided back-off deadline (epoch seconds). Strictly in the
    /// future of the moment it was assigned.
    pub cooldown_until: Option<f64>,
    pub error_count: u32,
    pub last_error_at: Option<f64>,
    pub deactivation_reason: Option<String>,
}

impl AccountState {
    pub fn new(account_id: impl Into<String>, status: AccountStatus) -> Self {
        Self {
            account_id: account_id.into(),
            status,
            used_percent: None,
            reset_at: None,
            cooldown_until: None,
            error_count: 0,
            last_error_at: None,
            deactivation_reason: None,
        }
    }
}

/// Error metadata fed into rate-limit/quota transitions.
#[derive(Debug, Clone, Default)]
pub struct UpstreamErrorHint {
    pub message: Option<String>,
    pub resets_at: Option<f64>,
    pub resets_in_seconds: Option<f64>,
}

/// Bounded exponential cooldown schedule.
#[derive(Debug, Clone, Copy)]
pub struct BackoffSchedule {
    pub base_seconds: f64,
    pub ceiling_seconds: f64,
}

impl BackoffSchedule {
    pub fn seconds(&self, error_count: u32) -> f64 {
        let factor = 2f64.powi(error_count.min(30) as i32);
        (self.base_seconds * factor).min(self.ceiling_seconds)
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self { base_seconds: 0.2, ceiling_seconds: 300.0 }
    }
}

/// Result of one selection pass.
#[derive(Debug, Clone)]
pub struct Selection {
    pub account_id: Option<String>,
    pub error_message: Option<String>,
    pub retry_after_seconds: Option<f64>,
}

/// Fresh usage-window sample, fed by the usage updater.
#[derive(Debug, Clone, Default)]
pub struct UsageSample {
    pub primary_used: Option<f64>,
    pub primary_reset: Option<f64>,
    pub primary_window_minutes: Option<i64>,
    pub secondary_used: Option<f64>,
    pub secondary_reset: Option<f64>,
}

/// Return current epoch seconds as a float.
pub fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// -- Pure transition logic ----------------------------------------------------

/// Clear an expired cooldown (resetting the error counters with it) and let
/// an elapsed rate window return the account to ACTIVE.
pub fn expire_cooldowns(state: &mut AccountState, now: f64) {
    if let Some(cooldown) = state.cooldown_until {
        if cooldown <= now {
            state.cooldown_until = None;
            state.last_error_at = None;
            state.error_count = 0;
        }
    }
    if matches!(state.status, AccountStatus::RateLimited | AccountStatus::QuotaExceeded) {
        if let Some(reset) = state.reset_at {
            if reset <= now {
                state.status = AccountStatus::Active;
                state.used_percent = None;
                state.reset_at = None;
            }
        }
    }
}

fn is_eligible(state: &AccountState, now: f64) -> bool {
    state.status == AccountStatus::Active
        && !state.cooldown_until.is_some_and(|c| c > now)
        && !state.reset_at.is_some_and(|r| r > now)
}

/// Earliest instant at which a currently skipped account could serve again.
fn skip_deadline(state: &AccountState, now: f64) -> Option<f64> {
    let cooldown = state.cooldown_until.filter(|c| *c > now);
    let reset = state.reset_at.filter(|r| *r > now);
    match (cooldown, reset) {
        (None, None) => None,
        (Some(c), None) => Some(c),
        (None, Some(r)) => Some(r),
        (Some(c), Some(r)) => Some(c.max(r)),
    }
}

/// Apply a rate-limit error: cooldown from the upstream retry hint when the
/// message carries one, else from the bounded backoff schedule. Status is not
/// forced; the cooldown alone takes the account out of rotation.
pub fn handle_rate_limit(
    state: &mut AccountState,
    hint: &UpstreamErrorHint,
    backoff: &BackoffSchedule,
    now: f64,
) {
    let hinted = hint.message.as_deref().and_then(parse_retry_after_hint);
    let cooldown = match hinted {
        Some(secs) if secs > 0.0 => secs,
        _ => backoff.seconds(state.error_count),
    };
    state.cooldown_until = Some(now + cooldown);
    state.error_count += 1;
    state.last_error_at = Some(now);
}

/// Apply a quota-exhausted error.
pub fn handle_quota_exceeded(state: &mut AccountState, hint: &UpstreamErrorHint) {
    state.status = AccountStatus::QuotaExceeded;
    state.used_percent = Some(100.0);
    if let Some(resets_at) = hint.resets_at {
        state.reset_at = Some(resets_at);
    }
}

/// Apply a permanent auth failure. Only an operator brings the account back.
pub fn handle_permanent_failure(state: &mut AccountState, code: &str) {
    state.status = AccountStatus::Deactivated;
    state.deactivation_reason =
        Some(permanent_failure_reason(code).map(str::to_owned).unwrap_or_else(|| code.to_owned()));
}

/// Fold a fresh usage sample into (status, used_percent, reset_at).
///
/// A saturated window (primary or secondary at 100%) rate-limits the account
/// until the first known reset; otherwise the account is active with the
/// primary-window usage. PAUSED and DEACTIVATED are never overridden by
/// usage data.
#[allow(clippy::too_many_arguments)]
pub fn apply_usage_quota(
    status: AccountStatus,
    primary_used: Option<f64>,
    primary_reset: Option<f64>,
    primary_window_minutes: Option<i64>,
    runtime_reset: Option<f64>,
    secondary_used: Option<f64>,
    secondary_reset: Option<f64>,
    now: f64,
) -> (AccountStatus, Option<f64>, Option<f64>) {
    if matches!(status, AccountStatus::Paused | AccountStatus::Deactivated) {
        return (status, primary_used, runtime_reset);
    }

    let primary_saturated = primary_used.is_some_and(|u| u >= 100.0);
    let secondary_saturated = secondary_used.is_some_and(|u| u >= 100.0);

    if primary_saturated || secondary_saturated {
        let reset_at = primary_reset
            .filter(|_| primary_saturated)
            .or(secondary_reset.filter(|_| secondary_saturated))
            .or(runtime_reset)
            .or_else(|| primary_window_minutes.map(|m| now + m as f64 * 60.0));
        let used = primary_used.unwrap_or(0.0).max(secondary_used.unwrap_or(0.0)).min(100.0);
        return (AccountStatus::RateLimited, Some(used), reset_at);
    }

    (AccountStatus::Active, primary_used, None)
}

/// Parse a `"Try again in <N>(.<F>)?(s|m|h)?"` hint into seconds.
pub fn parse_retry_after_hint(message: &str) -> Option<f64> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"(?i)try again in\s+(\d+(?:\.\d+)?)\s*(s|m|h)?").ok())
        .as_ref()?;
    let caps = re.captures(message)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let multiplier = match caps.get(2).map(|m| m.as_str().to_lowercase()) {
        Some(unit) if unit == "m" => 60.0,
        Some(unit) if unit == "h" => 3600.0,
        _ => 1.0,
    };
    Some(value * multiplier)
}

/// Render a wait hint: one decimal under a minute, whole minutes above.
pub fn format_wait_hint(seconds: f64) -> String {
    let seconds = seconds.max(0.0);
    if seconds < 60.0 {
        format!("Try again in {seconds:.1}s")
    } else {
        format!("Try again in {}m", (seconds / 60.0).ceil() as u64)
    }
}

// -- Balancer shell ------------------------------------------------------------

/// Owns the runtime state map. Mutations take the per-account lock; selection
/// snapshots the map under the read lock and re-validates the winner.
pub struct Balancer {
    states: RwLock<HashMap<String, Arc<Mutex<AccountState>>>>,
    backoff: BackoffSchedule,
}

impl Balancer {
    pub fn new(backoff: BackoffSchedule) -> Self {
        Self { states: RwLock::new(HashMap::new()), backoff }
    }

    /// Register (or re-seed) an account's runtime state.
    pub async fn register(&self, account: &Account, used_percent: Option<f64>) {
        let mut state = AccountState::new(account.id.clone(), account.status);
        state.used_percent = used_percent;
        state.deactivation_reason = account.deactivation_reason.clone();
        self.seed(state).await;
    }

    /// Insert a fully formed runtime state (startup seeding).
    pub async fn seed(&self, state: AccountState) {
        self.states.write().await.insert(state.account_id.clone(), Arc::new(Mutex::new(state)));
    }

    pub async fn remove(&self, account_id: &str) {
        self.states.write().await.remove(account_id);
    }

    async fn cell(&self, account_id: &str) -> Option<Arc<Mutex<AccountState>>> {
        self.states.read().await.get(account_id).map(Arc::clone)
    }

    /// Pick the eligible account with the lowest `used_percent` (ties: lowest
    /// `error_count`, then account id). With nothing eligible, the selection
    /// carries a wait hint for the nearest deadline among skipped accounts.
    pub async fn select_account(&self, now: f64) -> Selection {
        // Re-validation can fail if a concurrent error transition lands
        // between evaluation and the winner re-lock; one extra pass covers it.
        for _ in 0..2 {
            let entries: Vec<(String, Arc<Mutex<AccountState>>)> = {
                let states = self.states.read().await;
                states.iter().map(|(id, cell)| (id.clone(), Arc::clone(cell))).collect()
            };

            let mut best: Option<(f64, u32, String)> = None;
            let mut nearest_deadline: Option<f64> = None;

            for (id, cell) in &entries {
                let mut state = cell.lock().await;
                if matches!(state.status, AccountStatus::Paused | AccountStatus::Deactivated) {
                    continue;
                }
                expire_cooldowns(&mut state, now);
                if is_eligible(&state, now) {
                    let used = state.used_percent.unwrap_or(0.0);
                    let candidate = (used, state.error_count, id.clone());
                    let better = match &best {
                        None => true,
                        Some((b_used, b_errors, b_id)) => {
                            match candidate.0.total_cmp(b_used) {
                                std::cmp::Ordering::Less => true,
                                std::cmp::Ordering::Greater => false,
                                std::cmp::Ordering::Equal => (candidate.1, &candidate.2) < (*b_errors, b_id),
                            }
                        }
                    };
                    if better {
                        best = Some(candidate);
                    }
                } else if let Some(deadline) = skip_deadline(&state, now) {
                    nearest_deadline = Some(match nearest_deadline {
                        Some(current) => current.min(deadline),
                        None => deadline,
                    });
                }
            }

            let Some((_, _, winner)) = best else {
                return match nearest_deadline {
                    Some(deadline) => {
                        let wait = deadline - now;
                        Selection {
                            account_id: None,
                            error_message: Some(format_wait_hint(wait)),
                            retry_after_seconds: Some(wait),
                        }
                    }
                    None => Selection {
                        account_id: None,
                        error_message: Some("No accounts available".to_owned()),
                        retry_after_seconds: None,
                    },
                };
            };

            if let Some(cell) = self.cell(&winner).await {
                let state = cell.lock().await;
                if is_eligible(&state, now) {
                    return Selection {
                        account_id: Some(winner),
                        error_message: None,
                        retry_after_seconds: None,
                    };
                }
            }
        }

        Selection {
            account_id: None,
            error_message: Some("No accounts available".to_owned()),
            retry_after_seconds: None,
        }
    }

    pub async fn on_rate_limit(&self, account_id: &str, hint: &UpstreamErrorHint, now: f64) {
        if let Some(cell) = self.cell(account_id).await {
            let mut state = cell.lock().await;
            handle_rate_limit(&mut state, hint, &self.backoff, now);
            tracing::info!(
                account = %account_id,
                cooldown_until = ?state.cooldown_until,
                errors = state.error_count,
                "rate limited, cooling down"
            );
        }
    }

    pub async fn on_quota_exceeded(&self, account_id: &str, hint: &UpstreamErrorHint) {
        if let Some(cell) = self.cell(account_id).await {
            let mut state = cell.lock().await;
            handle_quota_exceeded(&mut state, hint);
            tracing::info!(account = %account_id, reset_at = ?state.reset_at, "quota exceeded");
        }
    }

    /// Returns the recorded deactivation reason for persistence.
    pub async fn on_permanent_failure(&self, account_id: &str, code: &str) -> String {
        let reason =
            permanent_failure_reason(code).map(str::to_owned).unwrap_or_else(|| code.to_owned());
        if let Some(cell) = self.cell(account_id).await {
            let mut state = cell.lock().await;
            handle_permanent_failure(&mut state, code);
            tracing::warn!(account = %account_id, code, "account deactivated");
        }
        reason
    }

    pub async fn on_transient_error(&self, account_id: &str, now: f64) {
        if let Some(cell) = self.cell(account_id).await {
            let mut state = cell.lock().await;
            state.error_count += 1;
            state.last_error_at = Some(now);
        }
    }

    pub async fn record_success(&self, account_id: &str) {
        if let Some(cell) = self.cell(account_id).await {
            let mut state = cell.lock().await;
            state.error_count = 0;
            state.last_error_at = None;
        }
    }

    /// Fold a fresh usage sample into the runtime state.
    pub async fn apply_usage(&self, account_id: &str, sample: &UsageSample, now: f64) {
        if let Some(cell) = self.cell(account_id).await {
            let mut state = cell.lock().await;
            let (status, used_percent, reset_at) = apply_usage_quota(
                state.status,
                sample.primary_used,
                sample.primary_reset,
                sample.primary_window_minutes,
                state.reset_at,
                sample.secondary_used,
                sample.secondary_reset,
                now,
            );
            state.status = status;
            state.used_percent = used_percent;
            state.reset_at = reset_at;
        }
    }

    /// Operator status override (pause/resume). Resuming clears the error
    /// bookkeeping along with any deactivation reason.
    pub async fn set_status(&self, account_id: &str, status: AccountStatus) {
        if let Some(cell) = self.cell(account_id).await {
            let mut state = cell.lock().await;
            state.status = status;
            if status == AccountStatus::Active {
                state.deactivation_reason = None;
                state.cooldown_until = None;
                state.error_count = 0;
                state.last_error_at = None;
            }
        }
    }

    pub async fn snapshot(&self) -> Vec<AccountState> {
        let entries: Vec<Arc<Mutex<AccountState>>> =
            self.states.read().await.values().map(Arc::clone).collect();
        let mut snapshot = Vec::with_capacity(entries.len());
        for cell in entries {
            snapshot.push(cell.lock().await.clone());
        }
        snapshot.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        snapshot
    }
}

#[cfg(test)]
#[path = "balancer_tests.rs"]
mod tests;
