// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Inbound request coercion: chat-completion `messages` become a Responses
//! `instructions`/`input` envelope, with the guard rails the upstream insists
//! on (`store` must stay false, `max_output_tokens` is unsupported).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fields the upstream rejects; stripped from every outbound payload.
const UNSUPPORTED_UPSTREAM_FIELDS: &[&str] = &["max_output_tokens"];

/// A Responses-API request envelope. Unknown fields ride along in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesRequest {
    pub model: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub input: Vec<Value>,
    #[serde(default)]
    pub tools: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Value>,
    /// Tri-state on purpose: absent stays absent on the wire, `false` is
    /// forwarded, `true` is rejected at parse time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default)]
    pub include: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_cache_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResponsesRequest {
    /// Parse and validate a request body, coercing `messages` when present.
    pub fn from_value(value: Value) -> anyhow::Result<Self> {
        let coerced = coerce_messages_payload(value)?;
        let request: ResponsesRequest = serde_json::from_value(coerced)
            .map_err(|e| anyhow::anyhow!("invalid request body: {e}"))?;
        if request.model.is_empty() {
            anyhow::bail!("'model' is required");
        }
        if request.store == Some(true) {
            anyhow::bail!("store must be false");
        }
        Ok(request)
    }

    /// Outbound payload: nulls dropped, unsupported fields stripped.
    pub fn to_payload(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.retain(|_, v| !v.is_null());
            for field in UNSUPPORTED_UPSTREAM_FIELDS {
                map.remove(*field);
            }
        }
        value
    }
}

/// Flatten message content to text: a plain string, a list of strings or
/// `{text}` parts (newline-joined, empty parts dropped), or one `{text}`
/// object. Anything else reads as absent.
fn content_to_text(content: Option<&Value>) -> Option<String> {
    match content? {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter_map(|part| match part {
                    Value::String(s) => Some(s.as_str()),
                    Value::Object(obj) => obj.get("text").and_then(|t| t.as_str()),
                    _ => None,
                })
                .filter(|s| !s.is_empty())
                .collect();
            Some(texts.join("\n"))
        }
        Value::Object(obj) => obj.get("text").and_then(|t| t.as_str()).map(str::to_owned),
        _ => None,
    }
}

fn merge_instructions(existing: &str, extra_parts: &[String]) -> String {
    let extra =
        extra_parts.iter().filter(|part| !part.is_empty()).cloned().collect::<Vec<_>>().join("\n");
    if extra.is_empty() {
        existing.to_owned()
    } else if existing.is_empty() {
        extra
    } else {
        format!("{existing}\n{extra}")
    }
}

/// Rewrite a `messages` payload into `instructions` + `input`.
///
/// System and developer messages collapse into `instructions` (appended to
/// any instructions already present); every other role lands in `input` in
/// order. `input` and `messages` together are rejected unless `input` is
/// empty.
fn coerce_messages_payload(value: Value) -> anyhow::Result<Value> {
    let Value::Object(mut map) = value else {
        anyhow::bail!("request body must be an object");
    };
    if !map.contains_key("messages") {
        return Ok(Value::Object(map));
    }

    let input_in_use = map.get("input").is_some_and(|v| match v {
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        _ => true,
    });
    if input_in_use {
        anyhow::bail!("Provide either 'input' or 'messages', not both.");
    }

    let Some(Value::Array(messages)) = map.remove("messages") else {
        anyhow::bail!("'messages' must be a list.");
    };

    let mut instructions_parts: Vec<String> = Vec::new();
    let mut input_messages: Vec<Value> = Vec::new();
    for message in messages {
        let Value::Object(message_map) = &message else {
            anyhow::bail!("Each message must be an object.");
        };
        let role = message_map.get("role").and_then(|r| r.as_str());
        if matches!(role, Some("system" | "developer")) {
            if let Some(text) = content_to_text(message_map.get("content")) {
                if !text.is_empty() {
                    instructions_parts.push(text);
                }
            }
            continue;
        }
        input_messages.push(message);
    }

    map.insert("input".to_owned(), Value::Array(input_messages));
    let existing =
        map.get("instructions").and_then(|v| v.as_str()).unwrap_or_default().to_owned();
    map.insert(
        "instructions".to_owned(),
        Value::String(merge_instructions(&existing, &instructions_parts)),
    );
    Ok(Value::Object(map))
}

#[cfg(test)]
#[path = "requests_tests.rs"]
mod tests;
