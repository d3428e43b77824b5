// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Integration tests for the pool HTTP API.
//!
//! Uses `axum_test::TestServer` — no real TCP needed. Upstream-facing flows
//! live in `proxy_flow.rs`.

use std::collections::HashMap;
use std::sync::Arc;

use axum_test::TestServer;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use codexpool::auth::AuthManager;
use codexpool::balancer::{BackoffSchedule, Balancer};
use codexpool::config::PoolConfig;
use codexpool::crypto::TokenCodec;
use codexpool::oauth::client::OAuthClient;
use codexpool::state::AppState;
use codexpool::store::json::JsonStore;
use codexpool::store::{epoch_secs, Account, AccountStatus, AccountsRepo, UsageRepo};
use codexpool::transport::build_router;
use codexpool::upstream::client::ApiClient;

fn test_config(auth_token: Option<String>) -> PoolConfig {
    PoolConfig {
        host: "127.0.0.1".into(),
        port: 0,
        auth_token,
        auth_base_url: "http://127.0.0.1:1".into(),
        oauth_client_id: "client-test".into(),
        oauth_redirect_uri: "http://localhost:1455/auth/callback".into(),
        oauth_scope: "openid profile email".into(),
        oauth_timeout_seconds: 2,
        api_base_url: "http://127.0.0.1:1".into(),
        store_path: None,
        migrations_fail_fast: false,
        token_key: None,
        usage_refresh_enabled: false,
        usage_refresh_interval_seconds: 300,
        refresh_ttl_seconds: 1_800,
        select_retries: 3,
        backoff_base_ms: 200,
        backoff_ceiling_ms: 300_000,
    }
}

fn test_state(auth_token: Option<String>) -> (Arc<AppState>, Arc<JsonStore>, Arc<TokenCodec>) {
    let config = test_config(auth_token);
    let store = Arc::new(JsonStore::in_memory());
    let codec = Arc::new(TokenCodec::new(&[11u8; 32]).expect("codec"));
    let oauth = Arc::new(OAuthClient::new(&config));
    let auth = Arc::new(AuthManager::new(
        Arc::clone(&store) as Arc<dyn AccountsRepo>,
        Arc::clone(&codec),
        Arc::clone(&oauth) as Arc<dyn codexpool::auth::TokenRefresher>,
        config.refresh_ttl_seconds,
    ));
    let balancer = Arc::new(Balancer::new(BackoffSchedule::default()));
    let api = ApiClient::new(&config.api_base_url);

    let state = Arc::new(AppState {
        config,
        accounts: Arc::clone(&store) as Arc<dyn AccountsRepo>,
        usage: Arc::clone(&store) as Arc<dyn UsageRepo>,
        codec: Arc::clone(&codec),
        oauth,
        auth,
        balancer,
        api,
        pending_auths: Mutex::new(HashMap::new()),
        shutdown: CancellationToken::new(),
    });
    (state, store, codec)
}

fn test_server(state: Arc<AppState>) -> TestServer {
    TestServer::new(build_router(state)).expect("failed to create test server")
}

async fn insert_account(state: &AppState, codec: &TokenCodec, id: &str) {
    let account = Account {
        id: id.to_owned(),
        email: Some(format!("{id}@example.com")),
        plan_type: "plus".to_owned(),
        access_token_encrypted: codec.encrypt("access").expect("encrypt"),
        refresh_token_encrypted: codec.encrypt("refresh").expect("encrypt"),
        id_token_encrypted: codec.encrypt("id").expect("encrypt"),
        last_refresh: epoch_secs(),
        status: AccountStatus::Active,
        deactivation_reason: None,
        created_at: epoch_secs(),
    };
    state.accounts.upsert(account.clone()).await.expect("upsert");
    state.balancer.register(&account, None).await;
}

#[tokio::test]
async fn health_returns_account_count() {
    let (state, _, codec) = test_state(None);
    insert_account(&state, &codec, "acct-1").await;
    insert_account(&state, &codec, "acct-2").await;

    let server = test_server(state);
    let resp = server.get("/api/v1/health").await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "running");
    assert_eq!(body["account_count"], 2);
}

#[tokio::test]
async fn accounts_list_includes_runtime_state() {
    let (state, _, codec) = test_state(None);
    insert_account(&state, &codec, "acct-1").await;

    let server = test_server(state);
    let resp = server.get("/api/v1/accounts").await;
    resp.assert_status_ok();

    let list: Vec<serde_json::Value> = resp.json();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], "acct-1");
    assert_eq!(list[0]["status"], "active");
    assert_eq!(list[0]["plan_type"], "plus");
    assert_eq!(list[0]["error_count"], 0);
}

#[tokio::test]
async fn store_true_is_rejected_without_upstream_contact() {
    let (state, _, codec) = test_state(None);
    insert_account(&state, &codec, "acct-1").await;

    let server = test_server(state);
    let resp = server
        .post("/v1/chat/completions")
        .json(&serde_json::json!({
            "model": "gpt-5.1",
            "store": true,
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .await;
    resp.assert_status(axum::http::StatusCode::BAD_REQUEST);

    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
    assert!(body["error"]["message"].as_str().unwrap_or_default().contains("store"));
}

#[tokio::test]
async fn input_and_messages_together_are_rejected() {
    let (state, _, codec) = test_state(None);
    insert_account(&state, &codec, "acct-1").await;

    let server = test_server(state);
    let resp = server
        .post("/v1/responses")
        .json(&serde_json::json!({
            "model": "gpt-5.1",
            "input": [{"role": "user", "content": "a"}],
            "messages": [{"role": "user", "content": "b"}],
        }))
        .await;
    resp.assert_status(axum::http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn invalid_json_is_rejected() {
    let (state, _, _) = test_state(None);
    let server = test_server(state);
    let resp = server.post("/v1/chat/completions").text("{not json").await;
    resp.assert_status(axum::http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn empty_pool_returns_429_with_hint() {
    let (state, _, _) = test_state(None);
    let server = test_server(state);
    let resp = server
        .post("/v1/chat/completions")
        .json(&serde_json::json!({
            "model": "gpt-5.1",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .await;
    resp.assert_status(axum::http::StatusCode::TOO_MANY_REQUESTS);

    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "POOL_EXHAUSTED");
    assert_eq!(body["error"]["message"], "No accounts available");
}

#[tokio::test]
async fn pause_and_resume_toggle_account() {
    let (state, _, codec) = test_state(None);
    insert_account(&state, &codec, "acct-1").await;
    let server = test_server(Arc::clone(&state));

    let resp = server.post("/api/v1/accounts/acct-1/pause").await;
    resp.assert_status_ok();
    let stored = state.accounts.get("acct-1").await.expect("get").expect("exists");
    assert_eq!(stored.status, AccountStatus::Paused);

    // Paused accounts never serve.
    let selection = state.balancer.select_account(codexpool::balancer::now_epoch()).await;
    assert_eq!(selection.account_id, None);

    let resp = server.post("/api/v1/accounts/acct-1/resume").await;
    resp.assert_status_ok();
    let stored = state.accounts.get("acct-1").await.expect("get").expect("exists");
    assert_eq!(stored.status, AccountStatus::Active);

    let selection = state.balancer.select_account(codexpool::balancer::now_epoch()).await;
    assert_eq!(selection.account_id.as_deref(), Some("acct-1"));
}

#[tokio::test]
async fn pause_unknown_account_returns_404() {
    let (state, _, _) = test_state(None);
    let server = test_server(state);
    let resp = server.post("/api/v1/accounts/nope/pause").await;
    resp.assert_status(axum::http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_account_removes_it() {
    let (state, _, codec) = test_state(None);
    insert_account(&state, &codec, "acct-1").await;
    let server = test_server(Arc::clone(&state));

    let resp = server.delete("/api/v1/accounts/acct-1").await;
    resp.assert_status_ok();
    assert!(state.accounts.get("acct-1").await.expect("get").is_none());
    assert!(state.balancer.snapshot().await.is_empty());
}

#[tokio::test]
async fn oauth_start_returns_authorization_url() {
    let (state, _, _) = test_state(None);
    let server = test_server(state);

    let resp = server.post("/api/v1/accounts/oauth/start").await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    let auth_url = body["auth_url"].as_str().unwrap_or_default();
    assert!(auth_url.starts_with("http://127.0.0.1:1/oauth/authorize?response_type=code"));
    // offline_access is enforced even though the configured scope lacks it.
    assert!(auth_url.contains("offline_access"));
    assert!(auth_url.contains("code_challenge_method=S256"));
    assert!(!body["state"].as_str().unwrap_or_default().is_empty());
}

#[tokio::test]
async fn oauth_complete_with_unknown_state_is_rejected() {
    let (state, _, _) = test_state(None);
    let server = test_server(state);
    let resp = server
        .post("/api/v1/accounts/oauth/complete")
        .json(&serde_json::json!({"state": "nope", "code": "irrelevant"}))
        .await;
    resp.assert_status(axum::http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn bearer_auth_guards_everything_but_health() {
    let (state, _, _) = test_state(Some("sekrit".into()));
    let server = test_server(state);

    let resp = server.get("/api/v1/health").await;
    resp.assert_status_ok();

    let resp = server.get("/api/v1/accounts").await;
    resp.assert_status(axum::http::StatusCode::UNAUTHORIZED);

    let resp =
        server.get("/api/v1/accounts").authorization_bearer("sekrit").await;
    resp.assert_status_ok();

    let resp =
        server.get("/api/v1/accounts").authorization_bearer("wrong").await;
    resp.assert_status(axum::http::StatusCode::UNAUTHORIZED);
}
