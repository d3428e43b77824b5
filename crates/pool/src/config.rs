// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the codexpool proxy.
#[derive(Debug, Clone, clap::Parser)]
pub struct PoolConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "CODEXPOOL_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 9700, env = "CODEXPOOL_PORT")]
    pub port: u16,

    /// Bearer token for downstream API auth. If unset, auth is disabled.
    #[arg(long, env = "CODEXPOOL_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Base URL of the upstream identity service.
    #[arg(long, default_value = "https://auth.openai.com", env = "CODEXPOOL_AUTH_BASE_URL")]
    pub auth_base_url: String,

    /// OAuth client id (public client, no secret).
    #[arg(
        long,
        default_value = "app_EMoamEEZ73f0CkXaXp7hrann",
        env = "CODEXPOOL_OAUTH_CLIENT_ID"
    )]
    pub oauth_client_id: String,

    /// Redirect URI registered for the authorization-code flow.
    #[arg(
        long,
        default_value = "http://localhost:1455/auth/callback",
        env = "CODEXPOOL_OAUTH_REDIRECT_URI"
    )]
    pub oauth_redirect_uri: String,

    /// OAuth scope. `offline_access` is appended if missing.
    #[arg(
        long,
        default_value = "openid profile email offline_access",
        env = "CODEXPOOL_OAUTH_SCOPE"
    )]
    pub oauth_scope: String,

    /// Timeout for identity-service requests, in seconds.
    #[arg(long, default_value_t = 30, env = "CODEXPOOL_OAUTH_TIMEOUT_SECONDS")]
    pub oauth_timeout_seconds: u64,

    /// Base URL of the upstream Responses API.
    #[arg(
        long,
        default_value = "https://chatgpt.com/backend-api/codex",
        env = "CODEXPOOL_API_BASE_URL"
    )]
    pub api_base_url: String,

    /// Path to the account/usage store. Defaults to `<state dir>/accounts.json`.
    #[arg(long, env = "CODEXPOOL_STORE_PATH")]
    pub store_path: Option<PathBuf>,

    /// Abort startup if the store's plan-normalization pass fails.
    #[arg(long, default_value_t = false, env = "CODEXPOOL_MIGRATIONS_FAIL_FAST")]
    pub migrations_fail_fast: bool,

    /// Base64-encoded 32-byte token key. Defaults to a generated key file.
    #[arg(long, env = "CODEXPOOL_TOKEN_KEY")]
    pub token_key: Option<String>,

    /// Whether the background usage refresh runs at all.
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        env = "CODEXPOOL_USAGE_REFRESH_ENABLED"
    )]
    pub usage_refresh_enabled: bool,

    /// Minimum age of a usage sample before it is refreshed, in seconds.
    #[arg(long, default_value_t = 300, env = "CODEXPOOL_USAGE_REFRESH_INTERVAL_SECONDS")]
    pub usage_refresh_interval_seconds: u64,

    /// Access-token age after which a refresh is due, in seconds.
    #[arg(long, default_value_t = 1800, env = "CODEXPOOL_REFRESH_TTL_SECONDS")]
    pub refresh_ttl_seconds: u64,

    /// Selection attempts per proxied request before giving up.
    #[arg(long, default_value_t = 3, env = "CODEXPOOL_SELECT_RETRIES")]
    pub select_retries: u32,

    /// Base of the rate-limit cooldown backoff, in milliseconds.
    #[arg(long, default_value_t = 200, env = "CODEXPOOL_BACKOFF_BASE_MS")]
    pub backoff_base_ms: u64,

    /// Ceiling of the rate-limit cooldown backoff, in milliseconds.
    #[arg(long, default_value_t = 300_000, env = "CODEXPOOL_BACKOFF_CEILING_MS")]
    pub backoff_ceiling_ms: u64,
}

impl PoolConfig {
    pub fn oauth_timeout(&self) -> Duration {
        Duration::from_secs(self.oauth_timeout_seconds)
    }

    pub fn usage_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.usage_refresh_interval_seconds)
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_ttl_seconds)
    }

    pub fn backoff_base_seconds(&self) -> f64 {
        self.backoff_base_ms as f64 / 1000.0
    }

    pub fn backoff_ceiling_seconds(&self) -> f64 {
        self.backoff_ceiling_ms as f64 / 1000.0
    }

    pub fn store_path_or_default(&self) -> PathBuf {
        self.store_path.clone().unwrap_or_else(|| state_dir().join("accounts.json"))
    }

    pub fn key_path(&self) -> PathBuf {
        state_dir().join("token.key")
    }
}

/// Resolve the state directory for pool data (store, token key).
///
/// Checks `CODEXPOOL_STATE_DIR`, then `$XDG_STATE_HOME/codexpool`,
/// then `$HOME/.local/state/codexpool`.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CODEXPOOL_STATE_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(xdg).join("codexpool");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/state/codexpool");
    }
    PathBuf::from(".codexpool")
}
