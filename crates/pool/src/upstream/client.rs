// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP client for the upstream Responses API.

use std::time::Duration;

use reqwest::Client;

/// Client wrapper for the Responses endpoint. Requests are bearer-token
/// authenticated per account; no total timeout is set because responses
/// stream for as long as generation runs.
pub struct ApiClient {
    base_url: String,
    client: Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { base_url: base_url.trim_end_matches('/').to_owned(), client }
    }

    /// POST a Responses payload on behalf of one account.
    pub async fn post_responses(
        &self,
        access_token: &str,
        account_id: &str,
        payload: &serde_json::Value,
        request_id: Option<&str>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let url = format!("{}/responses", self.base_url);
        let mut req = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .header("chatgpt-account-id", account_id)
            .header("accept", "text/event-stream")
            .json(payload);
        if let Some(id) = request_id {
            req = req.header("x-request-id", id);
        }
        req.send().await
    }
}
