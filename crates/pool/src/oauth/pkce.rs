// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OAuth authorization code + PKCE (RFC 7636) helpers.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Generate a PKCE code verifier (32 bytes of entropy, URL-safe).
pub fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compute code_challenge = base64url_nopad(sha256(verifier)).
pub fn pkce_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Generate a `(verifier, challenge)` pair.
pub fn generate_pkce_pair() -> (String, String) {
    let verifier = generate_code_verifier();
    let challenge = pkce_challenge(&verifier);
    (verifier, challenge)
}

/// Generate a random state parameter (32 bytes → 43 chars).
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Ensure `offline_access` is present so the exchange yields a refresh token.
pub fn ensure_offline_access(scope: &str) -> String {
    if scope.split_whitespace().any(|part| part == "offline_access") {
        scope.to_owned()
    } else if scope.is_empty() {
        "offline_access".to_owned()
    } else {
        format!("{scope} offline_access")
    }
}

/// Build the full authorization URL.
///
/// Parameter order matches the Codex CLI exactly, vendor flags included.
pub fn build_authorization_url(
    base_url: &str,
    client_id: &str,
    redirect_uri: &str,
    scope: &str,
    code_challenge: &str,
    state: &str,
) -> String {
    let base = base_url.trim_end_matches('/');
    let scope = ensure_offline_access(scope);
    format!(
        "{base}/oauth/authorize\
         ?response_type=code\
         &client_id={client_id}\
         &redirect_uri={redirect_uri}\
         &scope={scope}\
         &code_challenge={code_challenge}\
         &code_challenge_method=S256\
         &state={state}\
         &id_token_add_organizations=true\
         &codex_cli_simplified_flow=true\
         &originator=codex_cli_rs",
        client_id = urlencoding(client_id),
        redirect_uri = urlencoding(redirect_uri),
        scope = urlencoding(&scope),
        code_challenge = urlencoding(code_challenge),
        state = urlencoding(state),
    )
}

/// Percent-encoding for URL query parameters (RFC 3986 unreserved set).
fn urlencoding(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                char::from(b).to_string()
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}

#[cfg(test)]
#[path = "pkce_tests.rs"]
mod tests;
