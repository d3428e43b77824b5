// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP transport for the pool proxy.

pub mod auth;
pub mod http;
pub mod http_accounts;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

/// Build the axum `Router` with all pool routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health (no auth)
        .route("/api/v1/health", get(http::health))
        // Proxied API surface
        .route("/v1/responses", post(http::responses))
        .route("/v1/chat/completions", post(http::chat_completions))
        // Account pool management
        .route("/api/v1/accounts", get(http_accounts::list_accounts))
        .route("/api/v1/accounts/oauth/start", post(http_accounts::oauth_start))
        .route("/api/v1/accounts/oauth/complete", post(http_accounts::oauth_complete))
        .route("/api/v1/accounts/device/start", post(http_accounts::device_start))
        .route("/api/v1/accounts/{id}/pause", post(http_accounts::pause_account))
        .route("/api/v1/accounts/{id}/resume", post(http_accounts::resume_account))
        .route("/api/v1/accounts/{id}", delete(http_accounts::delete_account))
        // Middleware
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_layer))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
