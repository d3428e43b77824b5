// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persistent account and usage models, and the repository ports the rest of
//! the system consumes. The default implementation is the JSON file store in
//! [`json`]; anything satisfying the ports can be swapped in.

pub mod json;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a pooled account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    RateLimited,
    QuotaExceeded,
    Paused,
    Deactivated,
}

/// A pooled upstream account. Token blobs are AEAD-sealed; the store never
/// sees a plaintext token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub plan_type: String,
    #[serde(with = "b64")]
    pub access_token_encrypted: Vec<u8>,
    #[serde(with = "b64")]
    pub refresh_token_encrypted: Vec<u8>,
    #[serde(with = "b64")]
    pub id_token_encrypted: Vec<u8>,
    /// Epoch seconds of the last successful token refresh (or enrollment).
    pub last_refresh: u64,
    pub status: AccountStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deactivation_reason: Option<String>,
    pub created_at: u64,
}

/// One usage sample for one rate window of one account.
///
/// `window` of `None` is read as `"primary"` (rows predating the two-window
/// schema carried no label).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,
    pub used_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits_has: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits_unlimited: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits_balance: Option<f64>,
    /// Epoch seconds.
    pub recorded_at: u64,
}

impl UsageRecord {
    /// Window label with the back-compat `None` → `"primary"` rule applied.
    pub fn window_label(&self) -> &str {
        self.window.as_deref().unwrap_or("primary")
    }
}

/// Aggregated usage for one account since some instant.
#[derive(Debug, Clone, Serialize)]
pub struct UsageAggregate {
    pub account_id: String,
    pub used_percent_avg: Option<f64>,
    pub input_tokens_sum: Option<i64>,
    pub output_tokens_sum: Option<i64>,
    pub samples: u64,
    pub last_recorded_at: Option<u64>,
    pub reset_at_max: Option<i64>,
    pub window_minutes_max: Option<i64>,
}

/// Port over account persistence.
#[async_trait::async_trait]
pub trait AccountsRepo: Send + Sync {
    async fn list(&self) -> anyhow::Result<Vec<Account>>;
    async fn get(&self, account_id: &str) -> anyhow::Result<Option<Account>>;
    /// Insert or replace by id.
    async fn upsert(&self, account: Account) -> anyhow::Result<()>;
    async fn update_status(
        &self,
        account_id: &str,
        status: AccountStatus,
        deactivation_reason: Option<&str>,
    ) -> anyhow::Result<bool>;
    #[allow(clippy::too_many_arguments)]
    async fn update_tokens(
        &self,
        account_id: &str,
        access_token_encrypted: Vec<u8>,
        refresh_token_encrypted: Vec<u8>,
        id_token_encrypted: Vec<u8>,
        last_refresh: u64,
        plan_type: Option<&str>,
        email: Option<&str>,
    ) -> anyhow::Result<bool>;
    async fn delete(&self, account_id: &str) -> anyhow::Result<bool>;
}

/// Port over usage-history persistence.
#[async_trait::async_trait]
pub trait UsageRepo: Send + Sync {
    async fn add_entry(&self, entry: UsageRecord) -> anyhow::Result<()>;
    /// Latest row per account for the given window (`None` → primary).
    async fn latest_by_account(
        &self,
        window: Option<&str>,
    ) -> anyhow::Result<HashMap<String, UsageRecord>>;
    async fn latest_window_minutes(&self, window: &str) -> anyhow::Result<Option<i64>>;
    async fn aggregate_since(
        &self,
        since: u64,
        window: Option<&str>,
    ) -> anyhow::Result<Vec<UsageAggregate>>;
}

/// Return current epoch seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
