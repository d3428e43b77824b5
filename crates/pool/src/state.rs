// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthManager;
use crate::balancer::Balancer;
use crate::config::PoolConfig;
use crate::crypto::TokenCodec;
use crate::oauth::client::OAuthClient;
use crate::store::{AccountsRepo, UsageRepo};
use crate::upstream::client::ApiClient;

/// In-flight OAuth authorization code + PKCE flow, keyed by `state`.
pub struct PendingAuth {
    pub code_verifier: String,
    pub created_at: u64,
}

/// Shared application state.
pub struct AppState {
    pub config: PoolConfig,
    pub accounts: Arc<dyn AccountsRepo>,
    pub usage: Arc<dyn UsageRepo>,
    pub codec: Arc<TokenCodec>,
    pub oauth: Arc<OAuthClient>,
    pub auth: Arc<AuthManager>,
    pub balancer: Arc<Balancer>,
    pub api: ApiClient,
    /// Pending PKCE enrollments, keyed by the `state` parameter.
    pub pending_auths: Mutex<HashMap<String, PendingAuth>>,
    pub shutdown: CancellationToken,
}
