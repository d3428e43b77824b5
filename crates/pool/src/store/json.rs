// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JSON-file store: load/save with atomic writes, plan normalization on load.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::plan::{coerce_account_plan_type, DEFAULT_PLAN};
use crate::store::{
    epoch_secs, Account, AccountStatus, AccountsRepo, UsageAggregate, UsageRecord, UsageRepo,
};

/// Usage rows older than this are pruned on insert.
const USAGE_RETENTION_SECS: u64 = 7 * 24 * 3600;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreData {
    accounts: HashMap<String, Account>,
    #[serde(default)]
    usage: Vec<UsageRecord>,
}

/// File-backed store implementing both repository ports.
pub struct JsonStore {
    path: PathBuf,
    data: RwLock<StoreData>,
}

impl JsonStore {
    /// Load the store, applying the plan-type normalization pass. A parse
    /// failure surfaces as an error only when `fail_fast` is set; otherwise a
    /// fresh store is started and the old file is left untouched until the
    /// next save.
    pub fn load(path: &Path, fail_fast: bool) -> anyhow::Result<Self> {
        let mut data = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            match serde_json::from_str::<StoreData>(&contents) {
                Ok(data) => data,
                Err(e) if fail_fast => {
                    return Err(anyhow::anyhow!("store {} is corrupt: {e}", path.display()))
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), err = %e, "store unreadable, starting empty");
                    StoreData::default()
                }
            }
        } else {
            StoreData::default()
        };

        let normalized = normalize_plans(&mut data);
        if normalized > 0 {
            tracing::info!(count = normalized, "normalized account plan types");
        }

        Ok(Self { path: path.to_owned(), data: RwLock::new(data) })
    }

    pub fn in_memory() -> Self {
        Self { path: PathBuf::new(), data: RwLock::new(StoreData::default()) }
    }

    /// Save to disk atomically (write tmp + rename). No-op for in-memory stores.
    async fn save(&self, data: &StoreData) {
        if self.path.as_os_str().is_empty() {
            return;
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    tracing::warn!(err = %e, "failed to create store dir");
                    return;
                }
            }
        }
        let json = match serde_json::to_string_pretty(data) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(err = %e, "failed to serialize store");
                return;
            }
        };
        let tmp_path = self.path.with_extension("tmp");
        if let Err(e) =
            std::fs::write(&tmp_path, json).and_then(|()| std::fs::rename(&tmp_path, &self.path))
        {
            tracing::warn!(err = %e, path = %self.path.display(), "failed to persist store");
        }
    }
}

/// Coerce every account's plan through the canonicalizer. Returns how many
/// rows changed.
fn normalize_plans(data: &mut StoreData) -> usize {
    let mut changed = 0;
    for account in data.accounts.values_mut() {
        let coerced = coerce_account_plan_type(Some(&account.plan_type), DEFAULT_PLAN);
        if account.plan_type != coerced {
            account.plan_type = coerced;
            changed += 1;
        }
    }
    changed
}

fn matches_window(record: &UsageRecord, window: &str) -> bool {
    if window == "primary" {
        matches!(record.window.as_deref(), None | Some("primary"))
    } else {
        record.window.as_deref() == Some(window)
    }
}

#[async_trait::async_trait]
impl AccountsRepo for JsonStore {
    async fn list(&self) -> anyhow::Result<Vec<Account>> {
        let data = self.data.read().await;
        let mut accounts: Vec<Account> = data.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }

    async fn get(&self, account_id: &str) -> anyhow::Result<Option<Account>> {
        Ok(self.data.read().await.accounts.get(account_id).cloned())
    }

    async fn upsert(&self, account: Account) -> anyhow::Result<()> {
        let mut data = self.data.write().await;
        data.accounts.insert(account.id.clone(), account);
        self.save(&data).await;
        Ok(())
    }

    async fn update_status(
        &self,
        account_id: &str,
        status: AccountStatus,
        deactivation_reason: Option<&str>,
    ) -> anyhow::Result<bool> {
        let mut data = self.data.write().await;
        let Some(account) = data.accounts.get_mut(account_id) else {
            return Ok(false);
        };
        account.status = status;
        account.deactivation_reason = deactivation_reason.map(str::to_owned);
        self.save(&data).await;
        Ok(true)
    }

    async fn update_tokens(
        &self,
        account_id: &str,
        access_token_encrypted: Vec<u8>,
        refresh_token_encrypted: Vec<u8>,
        id_token_encrypted: Vec<u8>,
        last_refresh: u64,
        plan_type: Option<&str>,
        email: Option<&str>,
    ) -> anyhow::Result<bool> {
        let mut data = self.data.write().await;
        let Some(account) = data.accounts.get_mut(account_id) else {
            return Ok(false);
        };
        account.access_token_encrypted = access_token_encrypted;
        account.refresh_token_encrypted = refresh_token_encrypted;
        account.id_token_encrypted = id_token_encrypted;
        account.last_refresh = last_refresh;
        if let Some(plan) = plan_type {
            account.plan_type = plan.to_owned();
        }
        if let Some(email) = email {
            account.email = Some(email.to_owned());
        }
        self.save(&data).await;
        Ok(true)
    }

    async fn delete(&self, account_id: &str) -> anyhow::Result<bool> {
        let mut data = self.data.write().await;
        let removed = data.accounts.remove(account_id).is_some();
        if removed {
            data.usage.retain(|row| row.account_id != account_id);
            self.save(&data).await;
        }
        Ok(removed)
    }
}

#[async_trait::async_trait]
impl UsageRepo for JsonStore {
    async fn add_entry(&self, entry: UsageRecord) -> anyhow::Result<()> {
        let mut data = self.data.write().await;
        let cutoff = epoch_secs().saturating_sub(USAGE_RETENTION_SECS);
        data.usage.retain(|row| row.recorded_at >= cutoff);
        data.usage.push(entry);
        self.save(&data).await;
        Ok(())
    }

    async fn latest_by_account(
        &self,
        window: Option<&str>,
    ) -> anyhow::Result<HashMap<String, UsageRecord>> {
        let data = self.data.read().await;
        let window = window.unwrap_or("primary");
        let mut latest: HashMap<String, UsageRecord> = HashMap::new();
        for row in data.usage.iter().filter(|row| matches_window(row, window)) {
            let newer = latest
                .get(&row.account_id)
                .is_none_or(|current| current.recorded_at < row.recorded_at);
            if newer {
                latest.insert(row.account_id.clone(), row.clone());
            }
        }
        Ok(latest)
    }

    async fn latest_window_minutes(&self, window: &str) -> anyhow::Result<Option<i64>> {
        let data = self.data.read().await;
        Ok(data
            .usage
            .iter()
            .filter(|row| matches_window(row, window))
            .filter_map(|row| row.window_minutes)
            .max())
    }

    async fn aggregate_since(
        &self,
        since: u64,
        window: Option<&str>,
    ) -> anyhow::Result<Vec<UsageAggregate>> {
        let data = self.data.read().await;
        let mut grouped: HashMap<&str, Vec<&UsageRecord>> = HashMap::new();
        for row in data.usage.iter().filter(|row| row.recorded_at >= since) {
            if let Some(window) = window {
                if !matches_window(row, window) {
                    continue;
                }
            }
            grouped.entry(row.account_id.as_str()).or_default().push(row);
        }

        let mut aggregates: Vec<UsageAggregate> = grouped
            .into_iter()
            .map(|(account_id, rows)| {
                let samples = rows.len() as u64;
                let used_sum: f64 = rows.iter().map(|r| r.used_percent).sum();
                let sum_opt = |f: fn(&UsageRecord) -> Option<i64>| {
                    let values: Vec<i64> = rows.iter().filter_map(|r| f(r)).collect();
                    if values.is_empty() {
                        None
                    } else {
                        Some(values.iter().sum())
                    }
                };
                UsageAggregate {
                    account_id: account_id.to_owned(),
                    used_percent_avg: (samples > 0).then(|| used_sum / samples as f64),
                    input_tokens_sum: sum_opt(|r| r.input_tokens),
                    output_tokens_sum: sum_opt(|r| r.output_tokens),
                    samples,
                    last_recorded_at: rows.iter().map(|r| r.recorded_at).max(),
                    reset_at_max: rows.iter().filter_map(|r| r.reset_at).max(),
                    window_minutes_max: rows.iter().filter_map(|r| r.window_minutes).max(),
                }
            })
            .collect();
        aggregates.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        Ok(aggregates)
    }
}

#[cfg(test)]
#[path = "json_tests.rs"]
mod tests;
