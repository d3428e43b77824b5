// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Downstream bearer-token authentication.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::PoolError;
use crate::state::AppState;

/// Byte-wise comparison without early exit, so token checks leak no timing.
fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Extract the token from an `Authorization: Bearer ...` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers.get("authorization")?.to_str().ok()?.strip_prefix("Bearer ")
}

/// Validate the downstream bearer token. `None` expected means auth is off.
pub fn validate_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), PoolError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    match bearer_token(headers) {
        Some(token) if timing_safe_eq(token.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => Err(PoolError::Unauthorized),
    }
}

/// Axum middleware enforcing bearer auth on every route except the health
/// probe. CORS preflights pass through so the permissive CORS layer can
/// answer them.
pub async fn auth_layer(
    state: State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if req.uri().path() == "/api/v1/health" || req.method() == Method::OPTIONS {
        return next.run(req).await;
    }

    match validate_bearer(req.headers(), state.config.auth_token.as_deref()) {
        Ok(()) => next.run(req).await,
        Err(code) => {
            let status = StatusCode::from_u16(code.http_status())
                .unwrap_or(StatusCode::UNAUTHORIZED);
            let body = crate::error::ErrorResponse { error: code.to_error_body("unauthorized") };
            (status, axum::Json(body)).into_response()
        }
    }
}
