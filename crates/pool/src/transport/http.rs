// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Proxied request lifecycle: select an account, keep its token fresh,
//! dispatch upstream, observe the outcome, settle balancer state, stream the
//! response back (re-framed for chat-completion downstreams).

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::balancer::{now_epoch, Selection, UpstreamErrorHint};
use crate::error::{ErrorBody, ErrorResponse, PoolError};
use crate::openai::chat::{chat_sse_stream, collect_chat_completion};
use crate::openai::requests::ResponsesRequest;
use crate::state::AppState;
use crate::store::Account;
use crate::upstream::classify::{classify, parse_error_body, ErrorClass, UpstreamErrorInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wire {
    Responses,
    Chat,
}

#[derive(Debug, serde::Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub account_count: usize,
}

/// `GET /api/v1/health`
pub async fn health(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    let account_count = s.accounts.list().await.map(|a| a.len()).unwrap_or(0);
    Json(HealthResponse { status: "running".to_owned(), account_count })
}

/// `POST /v1/responses` — native Responses proxying.
pub async fn responses(State(s): State<Arc<AppState>>, body: Bytes) -> Response {
    dispatch_body(s, body, Wire::Responses).await
}

/// `POST /v1/chat/completions` — legacy chat-completion downstreams.
pub async fn chat_completions(State(s): State<Arc<AppState>>, body: Bytes) -> Response {
    dispatch_body(s, body, Wire::Chat).await
}

async fn dispatch_body(state: Arc<AppState>, body: Bytes, wire: Wire) -> Response {
    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return PoolError::InvalidRequest
                .to_http_response(format!("invalid JSON body: {e}"))
                .into_response()
        }
    };
    let request = match ResponsesRequest::from_value(value) {
        Ok(request) => request,
        Err(e) => return PoolError::InvalidRequest.to_http_response(e.to_string()).into_response(),
    };
    proxy_request(state, request, wire).await
}

/// One proxied request: up to `select_retries` account attempts.
async fn proxy_request(state: Arc<AppState>, request: ResponsesRequest, wire: Wire) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let stream_requested = request.stream.unwrap_or(false);
    let model = request.model.clone();

    let mut payload = request.to_payload();
    if wire == Wire::Chat {
        // The translator consumes the event stream either way; aggregation
        // happens on our side for non-streaming downstreams.
        if let serde_json::Value::Object(map) = &mut payload {
            map.insert("stream".to_owned(), serde_json::Value::Bool(true));
        }
    }

    let budget = state.config.select_retries.max(1);
    let mut last_error: Option<UpstreamErrorInfo> = None;
    let mut last_selection: Option<Selection> = None;

    for _attempt in 0..budget {
        let now = now_epoch();
        let selection = state.balancer.select_account(now).await;
        let Some(account_id) = selection.account_id.clone() else {
            last_selection = Some(selection);
            break;
        };

        let account = match state.accounts.get(&account_id).await {
            Ok(Some(account)) => account,
            _ => {
                // Runtime state outlived the stored account; drop it.
                state.balancer.remove(&account_id).await;
                continue;
            }
        };

        let mut account = match state.auth.ensure_fresh(&account, false).await {
            Ok(account) => account,
            Err(failure) if failure.permanent => {
                state.balancer.on_permanent_failure(&account_id, &failure.code).await;
                continue;
            }
            Err(_) => {
                state.balancer.on_transient_error(&account_id, now).await;
                continue;
            }
        };

        // Inner loop so a 401 can force one refresh and retry the same
        // account before the attempt is spent.
        let mut refreshed_once = false;
        loop {
            let access_token = match state.codec.decrypt(&account.access_token_encrypted) {
                Ok(token) => token,
                Err(e) => {
                    tracing::warn!(account = %account.id, err = %e, "access token unreadable");
                    state.balancer.on_transient_error(&account.id, now).await;
                    break;
                }
            };

            let resp = match state
                .api
                .post_responses(&access_token, &account.id, &payload, Some(&request_id))
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::debug!(account = %account.id, err = %e, "upstream dispatch failed");
                    state.balancer.on_transient_error(&account.id, now).await;
                    break;
                }
            };

            if resp.status().is_success() {
                state.balancer.record_success(&account.id).await;
                return settle_success(&state, resp, &account, wire, stream_requested, &model, &request_id)
                    .await;
            }

            let http_status = resp.status().as_u16();
            let body = resp.bytes().await.unwrap_or_default();
            let info = parse_error_body(http_status, &body);
            tracing::debug!(
                account = %account.id,
                status = http_status,
                code = %info.code,
                "upstream error"
            );

            match classify(&info) {
                ErrorClass::Unauthorized if !refreshed_once => {
                    refreshed_once = true;
                    match state.auth.ensure_fresh(&account, true).await {
                        Ok(fresh) => {
                            account = fresh;
                            continue;
                        }
                        Err(failure) if failure.permanent => {
                            state.balancer.on_permanent_failure(&account.id, &failure.code).await;
                            last_error = Some(info);
                            break;
                        }
                        Err(_) => {
                            state.balancer.on_transient_error(&account.id, now).await;
                            last_error = Some(info);
                            break;
                        }
                    }
                }
                ErrorClass::Unauthorized => {
                    state.balancer.on_transient_error(&account.id, now).await;
                    last_error = Some(info);
                    break;
                }
                ErrorClass::RateLimited => {
                    state.balancer.on_rate_limit(&account.id, &hint_of(&info), now).await;
                    last_error = Some(info);
                    break;
                }
                ErrorClass::QuotaExceeded => {
                    state.balancer.on_quota_exceeded(&account.id, &hint_of(&info)).await;
                    if let Err(e) = state
                        .accounts
                        .update_status(&account.id, crate::store::AccountStatus::QuotaExceeded, None)
                        .await
                    {
                        tracing::warn!(account = %account.id, err = %e, "failed to persist quota status");
                    }
                    last_error = Some(info);
                    break;
                }
                ErrorClass::PermanentAuth => {
                    let reason = state.balancer.on_permanent_failure(&account.id, &info.code).await;
                    if let Err(e) = state
                        .accounts
                        .update_status(
                            &account.id,
                            crate::store::AccountStatus::Deactivated,
                            Some(&reason),
                        )
                        .await
                    {
                        tracing::warn!(account = %account.id, err = %e, "failed to persist deactivation");
                    }
                    last_error = Some(info);
                    break;
                }
                ErrorClass::Transient => {
                    state.balancer.on_transient_error(&account.id, now).await;
                    last_error = Some(info);
                    break;
                }
                ErrorClass::Other => {
                    return upstream_error_response(&info);
                }
            }
        }
    }

    exhausted_response(last_selection, last_error)
}

fn hint_of(info: &UpstreamErrorInfo) -> UpstreamErrorHint {
    UpstreamErrorHint {
        message: Some(info.message.clone()),
        resets_at: info.resets_at,
        resets_in_seconds: info.resets_in_seconds,
    }
}

/// Surface an upstream failure verbatim, metadata attached.
fn upstream_error_response(info: &UpstreamErrorInfo) -> Response {
    let status =
        StatusCode::from_u16(info.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorResponse {
        error: ErrorBody {
            code: info.code.clone(),
            message: info.message.clone(),
            plan_type: info.plan_type.clone(),
            resets_at: info.resets_at,
            resets_in_seconds: info.resets_in_seconds,
        },
    };
    (status, Json(body)).into_response()
}

/// Budget spent, or no account eligible at all.
fn exhausted_response(selection: Option<Selection>, last_error: Option<UpstreamErrorInfo>) -> Response {
    if let Some(info) = last_error {
        return upstream_error_response(&info);
    }
    let message = selection
        .and_then(|s| s.error_message)
        .unwrap_or_else(|| "No accounts available".to_owned());
    PoolError::PoolExhausted.to_http_response(message).into_response()
}

/// Stream the upstream response back with the account's usage snapshot in
/// the response headers.
async fn settle_success(
    state: &AppState,
    resp: reqwest::Response,
    account: &Account,
    wire: Wire,
    stream_requested: bool,
    model: &str,
    request_id: &str,
) -> Response {
    let upstream_status = resp.status();
    let upstream_content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_owned();

    let mut headers: Vec<(String, String)> = usage_headers(state, &account.id).await;
    headers.push(("x-request-id".to_owned(), request_id.to_owned()));
    if let Some(id) = header_account_id(&account.id) {
        headers.push(("x-codex-account-id".to_owned(), id.to_owned()));
    }

    let (content_type, body) = match wire {
        Wire::Responses => {
            (upstream_content_type, Body::from_stream(resp.bytes_stream()))
        }
        Wire::Chat if stream_requested => (
            "text/event-stream".to_owned(),
            Body::from_stream(chat_sse_stream(resp.bytes_stream(), model)),
        ),
        Wire::Chat => {
            let completion = match collect_chat_completion(resp.bytes_stream(), model).await {
                Ok(completion) => completion,
                Err(e) => {
                    tracing::warn!(err = %e, "upstream stream failed mid-collection");
                    return PoolError::UpstreamError
                        .to_http_response("upstream stream interrupted")
                        .into_response();
                }
            };
            let body = serde_json::to_vec(&completion).unwrap_or_default();
            ("application/json".to_owned(), Body::from(body))
        }
    };

    let mut builder = axum::http::Response::builder()
        .status(StatusCode::from_u16(upstream_status.as_u16()).unwrap_or(StatusCode::OK))
        .header("content-type", content_type);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    match builder.body(body) {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(err = %e, "failed to build proxied response");
            PoolError::Internal.to_http_response("response assembly failed").into_response()
        }
    }
}

/// Synthetic ids never leave the proxy.
fn header_account_id(account_id: &str) -> Option<&str> {
    if account_id.starts_with("email_") || account_id.starts_with("local_") {
        None
    } else {
        Some(account_id)
    }
}

/// Informational `x-codex-*` headers from the latest usage rows.
async fn usage_headers(state: &AppState, account_id: &str) -> Vec<(String, String)> {
    let mut headers = Vec::new();

    for label in ["primary", "secondary"] {
        let Ok(mut latest) = state.usage.latest_by_account(Some(label)).await else {
            continue;
        };
        let Some(row) = latest.remove(account_id) else {
            continue;
        };
        let Some(window_minutes) = row.window_minutes else {
            continue;
        };
        headers.push((format!("x-codex-{label}-used-percent"), format!("{}", row.used_percent)));
        headers.push((format!("x-codex-{label}-window-minutes"), window_minutes.to_string()));
        if let Some(reset_at) = row.reset_at {
            headers.push((format!("x-codex-{label}-reset-at"), reset_at.to_string()));
        }
        if label == "primary" {
            let any_credits = row.credits_has.is_some()
                || row.credits_unlimited.is_some()
                || row.credits_balance.is_some();
            if any_credits {
                let has = row.credits_has.unwrap_or(false) || row.credits_unlimited.unwrap_or(false);
                headers.push(("x-codex-credits-has-credits".to_owned(), bool_str(has).to_owned()));
                headers.push((
                    "x-codex-credits-unlimited".to_owned(),
                    bool_str(row.credits_unlimited.unwrap_or(false)).to_owned(),
                ));
                headers.push((
                    "x-codex-credits-balance".to_owned(),
                    format!("{:.2}", row.credits_balance.unwrap_or(0.0)),
                ));
            }
        }
    }

    headers
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}
