// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end proxy flows against a fake upstream bound to a real port:
//! streaming translation, failover, forced refresh, quota handling.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
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
use codexpool::store::{epoch_secs, Account, AccountStatus, AccountsRepo, UsageRecord, UsageRepo};
use codexpool::transport::build_router;
use codexpool::upstream::client::ApiClient;

const SSE_TEXT: &str = concat!(
    "data: {\"type\":\"response.output_text.delta\",\"delta\":\"he\"}\n\n",
    "data: {\"type\":\"response.output_text.delta\",\"delta\":\"llo\"}\n\n",
    "data: {\"type\":\"response.completed\",\"response\":{\"id\":\"r1\"}}\n\n",
);

async fn spawn_http(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}

fn sse_response() -> axum::response::Response {
    ([("content-type", "text/event-stream")], SSE_TEXT).into_response()
}

struct Pool {
    state: Arc<AppState>,
    server: TestServer,
    codec: Arc<TokenCodec>,
    store: Arc<JsonStore>,
}

async fn pool_with(api_base_url: &str, auth_base_url: &str) -> Pool {
    let config = PoolConfig {
        host: "127.0.0.1".into(),
        port: 0,
        auth_token: None,
        auth_base_url: auth_base_url.into(),
        oauth_client_id: "client-test".into(),
        oauth_redirect_uri: "http://localhost:1455/auth/callback".into(),
        oauth_scope: "openid profile email offline_access".into(),
        oauth_timeout_seconds: 2,
        api_base_url: api_base_url.into(),
        store_path: None,
        migrations_fail_fast: false,
        token_key: None,
        usage_refresh_enabled: false,
        usage_refresh_interval_seconds: 300,
        refresh_ttl_seconds: 1_800,
        select_retries: 3,
        backoff_base_ms: 200,
        backoff_ceiling_ms: 300_000,
    };
    let store = Arc::new(JsonStore::in_memory());
    let codec = Arc::new(TokenCodec::new(&[13u8; 32]).expect("codec"));
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
    let server = TestServer::new(build_router(Arc::clone(&state))).expect("test server");
    Pool { state, server, codec, store }
}

async fn seed_account(pool: &Pool, id: &str, access_token: &str, used_percent: Option<f64>) {
    let account = Account {
        id: id.to_owned(),
        email: Some(format!("{id}@example.com")),
        plan_type: "plus".to_owned(),
        access_token_encrypted: pool.codec.encrypt(access_token).expect("encrypt"),
        refresh_token_encrypted: pool.codec.encrypt("refresh-token").expect("encrypt"),
        id_token_encrypted: pool.codec.encrypt("id-token").expect("encrypt"),
        last_refresh: epoch_secs(),
        status: AccountStatus::Active,
        deactivation_reason: None,
        created_at: epoch_secs(),
    };
    pool.store.upsert(account.clone()).await.expect("upsert");
    pool.state.balancer.register(&account, used_percent).await;
}

fn chat_body(stream: bool) -> serde_json::Value {
    serde_json::json!({
        "model": "gpt-5.1",
        "stream": stream,
        "messages": [
            {"role": "system", "content": "sys"},
            {"role": "user", "content": "hi"},
        ],
    })
}

#[tokio::test]
async fn chat_stream_translates_end_to_end() {
    let upstream = spawn_http(Router::new().route("/responses", post(|| async { sse_response() }))).await;
    let pool = pool_with(&upstream, "http://127.0.0.1:1").await;
    seed_account(&pool, "acct-1", "access", None).await;

    let resp = pool.server.post("/v1/chat/completions").json(&chat_body(true)).await;
    resp.assert_status_ok();
    assert_eq!(resp.header("content-type"), "text/event-stream");
    assert_eq!(resp.header("x-codex-account-id"), "acct-1");

    let text = resp.text();
    let content: String = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter_map(|data| serde_json::from_str::<serde_json::Value>(data).ok())
        .filter_map(|chunk| chunk["choices"][0]["delta"]["content"].as_str().map(str::to_owned))
        .collect();
    assert_eq!(content, "hello");
    assert!(text.contains(r#""finish_reason":"stop""#));
    assert!(text.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn chat_non_stream_aggregates_the_response() {
    let upstream = spawn_http(Router::new().route("/responses", post(|| async { sse_response() }))).await;
    let pool = pool_with(&upstream, "http://127.0.0.1:1").await;
    seed_account(&pool, "acct-1", "access", None).await;

    let resp = pool.server.post("/v1/chat/completions").json(&chat_body(false)).await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "hello");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn responses_requests_pass_through_untranslated() {
    let upstream = spawn_http(Router::new().route("/responses", post(|| async { sse_response() }))).await;
    let pool = pool_with(&upstream, "http://127.0.0.1:1").await;
    seed_account(&pool, "acct-1", "access", None).await;

    let resp = pool
        .server
        .post("/v1/responses")
        .json(&serde_json::json!({
            "model": "gpt-5.1",
            "stream": true,
            "input": [{"role": "user", "content": "hi"}],
        }))
        .await;
    resp.assert_status_ok();
    assert_eq!(resp.text(), SSE_TEXT);
}

#[tokio::test]
async fn rate_limited_account_fails_over() {
    // acct-a is the preferred (least used) account but always rate limited.
    let upstream = spawn_http(Router::new().route(
        "/responses",
        post(|headers: HeaderMap| async move {
            let account =
                headers.get("chatgpt-account-id").and_then(|v| v.to_str().ok()).unwrap_or("");
            if account == "acct-a" {
                (
                    axum::http::StatusCode::TOO_MANY_REQUESTS,
                    axum::Json(serde_json::json!({"error": {
                        "code": "rate_limit_exceeded",
                        "message": "Try again in 30s",
                        "plan_type": "plus",
                    }})),
                )
                    .into_response()
            } else {
                sse_response()
            }
        }),
    ))
    .await;
    let pool = pool_with(&upstream, "http://127.0.0.1:1").await;
    seed_account(&pool, "acct-a", "access-a", Some(10.0)).await;
    seed_account(&pool, "acct-b", "access-b", Some(50.0)).await;

    let resp = pool.server.post("/v1/chat/completions").json(&chat_body(true)).await;
    resp.assert_status_ok();
    assert_eq!(resp.header("x-codex-account-id"), "acct-b");

    let snapshot = pool.state.balancer.snapshot().await;
    let a = snapshot.iter().find(|s| s.account_id == "acct-a").expect("acct-a");
    assert!(a.cooldown_until.is_some(), "rate-limited account must cool down");
    assert_eq!(a.error_count, 1);
}

#[tokio::test]
async fn unauthorized_forces_refresh_and_retries_same_account() {
    let upstream = spawn_http(Router::new().route(
        "/responses",
        post(|headers: HeaderMap| async move {
            let bearer =
                headers.get("authorization").and_then(|v| v.to_str().ok()).unwrap_or("");
            if bearer == "Bearer fresh-access" {
                sse_response()
            } else {
                (
                    axum::http::StatusCode::UNAUTHORIZED,
                    axum::Json(serde_json::json!({"error": {"code": "token_expired"}})),
                )
                    .into_response()
            }
        }),
    ))
    .await;
    let identity = spawn_http(Router::new().route(
        "/oauth/token",
        post(|| async {
            axum::Json(serde_json::json!({
                "access_token": "fresh-access",
                "refresh_token": "fresh-refresh",
                "id_token": "fresh-id",
            }))
        }),
    ))
    .await;

    let pool = pool_with(&upstream, &identity).await;
    seed_account(&pool, "acct-1", "stale-access", None).await;

    let resp = pool.server.post("/v1/chat/completions").json(&chat_body(true)).await;
    resp.assert_status_ok();

    let stored = pool.store.get("acct-1").await.expect("get").expect("exists");
    assert_eq!(
        pool.codec.decrypt(&stored.access_token_encrypted).expect("decrypt"),
        "fresh-access"
    );
}

#[tokio::test]
async fn permanent_refresh_failure_deactivates_and_surfaces() {
    let upstream = spawn_http(Router::new().route(
        "/responses",
        post(|| async {
            (
                axum::http::StatusCode::UNAUTHORIZED,
                axum::Json(serde_json::json!({"error": {"code": "token_expired"}})),
            )
        }),
    ))
    .await;
    let identity = spawn_http(Router::new().route(
        "/oauth/token",
        post(|| async {
            (
                axum::http::StatusCode::BAD_REQUEST,
                axum::Json(serde_json::json!({"error": "invalid_grant"})),
            )
        }),
    ))
    .await;

    let pool = pool_with(&upstream, &identity).await;
    seed_account(&pool, "acct-1", "stale-access", None).await;

    let resp = pool.server.post("/v1/chat/completions").json(&chat_body(true)).await;
    resp.assert_status(axum::http::StatusCode::UNAUTHORIZED);

    let stored = pool.store.get("acct-1").await.expect("get").expect("exists");
    assert_eq!(stored.status, AccountStatus::Deactivated);
    assert!(stored.deactivation_reason.is_some());
}

#[tokio::test]
async fn quota_exceeded_marks_account_until_reset() {
    let resets_at = epoch_secs() + 3_600;
    let upstream = spawn_http(Router::new().route(
        "/responses",
        post(move || async move {
            (
                axum::http::StatusCode::FORBIDDEN,
                axum::Json(serde_json::json!({"error": {
                    "code": "quota_exceeded",
                    "message": "Quota exhausted",
                    "resets_at": resets_at,
                }})),
            )
        }),
    ))
    .await;
    let pool = pool_with(&upstream, "http://127.0.0.1:1").await;
    seed_account(&pool, "acct-1", "access", None).await;

    let resp = pool.server.post("/v1/chat/completions").json(&chat_body(true)).await;
    resp.assert_status(axum::http::StatusCode::FORBIDDEN);

    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "quota_exceeded");
    assert_eq!(body["error"]["resets_at"], serde_json::json!(resets_at as f64));

    let stored = pool.store.get("acct-1").await.expect("get").expect("exists");
    assert_eq!(stored.status, AccountStatus::QuotaExceeded);
    let snapshot = pool.state.balancer.snapshot().await;
    assert_eq!(snapshot[0].used_percent, Some(100.0));
    assert_eq!(snapshot[0].reset_at, Some(resets_at as f64));
}

#[tokio::test]
async fn usage_snapshot_rides_on_response_headers() {
    let upstream = spawn_http(Router::new().route("/responses", post(|| async { sse_response() }))).await;
    let pool = pool_with(&upstream, "http://127.0.0.1:1").await;
    seed_account(&pool, "acct-1", "access", None).await;

    let now = epoch_secs();
    pool.store
        .add_entry(UsageRecord {
            account_id: "acct-1".to_owned(),
            window: Some("primary".to_owned()),
            used_percent: 33.0,
            reset_at: Some(1_700_000_600),
            window_minutes: Some(300),
            input_tokens: None,
            output_tokens: None,
            credits_has: Some(true),
            credits_unlimited: Some(false),
            credits_balance: Some(14.5),
            recorded_at: now,
        })
        .await
        .expect("add");
    pool.store
        .add_entry(UsageRecord {
            account_id: "acct-1".to_owned(),
            window: Some("secondary".to_owned()),
            used_percent: 12.0,
            reset_at: Some(1_700_600_000),
            window_minutes: Some(10_080),
            input_tokens: None,
            output_tokens: None,
            credits_has: None,
            credits_unlimited: None,
            credits_balance: None,
            recorded_at: now,
        })
        .await
        .expect("add");

    let resp = pool.server.post("/v1/chat/completions").json(&chat_body(true)).await;
    resp.assert_status_ok();
    assert_eq!(resp.header("x-codex-primary-used-percent"), "33");
    assert_eq!(resp.header("x-codex-primary-window-minutes"), "300");
    assert_eq!(resp.header("x-codex-primary-reset-at"), "1700000600");
    assert_eq!(resp.header("x-codex-secondary-used-percent"), "12");
    assert_eq!(resp.header("x-codex-secondary-window-minutes"), "10080");
    assert_eq!(resp.header("x-codex-credits-has-credits"), "true");
    assert_eq!(resp.header("x-codex-credits-unlimited"), "false");
    assert_eq!(resp.header("x-codex-credits-balance"), "14.50");
}
