// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Codexpool: multi-account reverse proxy for the Codex Responses API.

pub mod auth;
pub mod balancer;
pub mod config;
pub mod crypto;
pub mod error;
pub mod oauth;
pub mod openai;
pub mod plan;
pub mod state;
pub mod store;
pub mod transport;
pub mod upstream;
pub mod usage;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthManager;
use crate::balancer::{BackoffSchedule, Balancer};
use crate::config::PoolConfig;
use crate::crypto::{load_or_create_key, TokenCodec};
use crate::oauth::client::OAuthClient;
use crate::state::AppState;
use crate::store::json::JsonStore;
use crate::store::{AccountsRepo, UsageRepo};
use crate::transport::build_router;
use crate::upstream::client::ApiClient;
use crate::usage::{spawn_usage_loop, HttpUsageFetcher, UsageUpdater};

/// Run the pool server until shutdown.
pub async fn run(config: PoolConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();

    let key = load_or_create_key(config.token_key.as_deref(), &config.key_path())?;
    let codec = Arc::new(TokenCodec::new(&key)?);

    let store = Arc::new(JsonStore::load(
        &config.store_path_or_default(),
        config.migrations_fail_fast,
    )?);
    let accounts: Arc<dyn AccountsRepo> = Arc::clone(&store) as Arc<dyn AccountsRepo>;
    let usage: Arc<dyn UsageRepo> = Arc::clone(&store) as Arc<dyn UsageRepo>;

    let oauth = Arc::new(OAuthClient::new(&config));
    let auth = Arc::new(AuthManager::new(
        Arc::clone(&accounts),
        Arc::clone(&codec),
        Arc::clone(&oauth) as Arc<dyn crate::auth::TokenRefresher>,
        config.refresh_ttl_seconds,
    ));

    let balancer = Arc::new(Balancer::new(BackoffSchedule {
        base_seconds: config.backoff_base_seconds(),
        ceiling_seconds: config.backoff_ceiling_seconds(),
    }));
    seed_balancer(&accounts, &usage, &balancer).await;

    let fetcher = Arc::new(HttpUsageFetcher::new(&config.api_base_url));
    let updater = Arc::new(UsageUpdater::new(
        Arc::clone(&usage),
        Arc::clone(&codec),
        fetcher,
        Some(Arc::clone(&auth)),
        Arc::clone(&balancer),
        config.usage_refresh_enabled,
        config.usage_refresh_interval_seconds,
    ));
    spawn_usage_loop(
        Arc::clone(&accounts),
        Arc::clone(&usage),
        updater,
        config.usage_refresh_interval(),
        shutdown.clone(),
    );

    let api = ApiClient::new(&config.api_base_url);
    let state = Arc::new(AppState {
        config,
        accounts,
        usage,
        codec,
        oauth,
        auth,
        balancer,
        api,
        pending_auths: Mutex::new(HashMap::new()),
        shutdown: shutdown.clone(),
    });

    // Ctrl-C triggers a graceful drain.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    tracing::info!("codexpool listening on {addr}");
    let router = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    Ok(())
}

/// Seed runtime state from the store: persisted status plus the latest
/// primary-window usage per account.
async fn seed_balancer(
    accounts: &Arc<dyn AccountsRepo>,
    usage: &Arc<dyn UsageRepo>,
    balancer: &Arc<Balancer>,
) {
    let list = match accounts.list().await {
        Ok(list) => list,
        Err(e) => {
            tracing::warn!(err = %e, "failed to list accounts at startup");
            return;
        }
    };
    let latest = usage.latest_by_account(Some("primary")).await.unwrap_or_default();
    for account in &list {
        let used_percent = latest.get(&account.id).map(|row| row.used_percent);
        balancer.register(account, used_percent).await;
    }
    tracing::info!(accounts = list.len(), "balancer seeded");
}
