// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Responses→chat-completion stream translation.
//!
//! The upstream SSE stream of typed events is re-framed into chat-completion
//! chunks. Tool-call identity survives fragmentation: each distinct `call_id`
//! gets a stable 0-based `index` in first-appearance order, the function name
//! is emitted once, and argument fragments pass through byte-for-byte.

use std::collections::VecDeque;

use bytes::Bytes;
use futures_util::{stream, Stream, StreamExt};
use indexmap::IndexMap;
use serde_json::{json, Value};

use crate::openai::sse::format_sse_event;
use crate::store::epoch_secs;

const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Incremental SSE event parser over a byte stream.
///
/// Splits on blank lines at event boundaries (so multi-byte characters split
/// across network chunks are never torn) and yields the joined `data:`
/// payload of each complete event.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
}

impl SseParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = find_event_boundary(&self.buf) {
            let block: Vec<u8> = self.buf.drain(..pos + 2).collect();
            let text = String::from_utf8_lossy(&block);
            let data: Vec<&str> = text
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
                .collect();
            if !data.is_empty() {
                out.push(data.join("\n"));
            }
        }
        out
    }
}

fn find_event_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

struct ToolCallSlot {
    index: usize,
    name_sent: bool,
}

/// Streaming translator: one upstream event in, zero or more framed chat
/// chunks out.
pub struct ChatTranslator {
    model: String,
    completion_id: String,
    created: u64,
    calls: IndexMap<String, ToolCallSlot>,
    finished: bool,
}

impl ChatTranslator {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_owned(),
            completion_id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: epoch_secs(),
            calls: IndexMap::new(),
            finished: false,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> String {
        let payload = json!({
            "id": self.completion_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        format_sse_event(&payload)
    }

    fn finish_reason(&self) -> &'static str {
        if self.calls.is_empty() {
            "stop"
        } else {
            "tool_calls"
        }
    }

    /// Translate one upstream `data:` payload into framed chat chunks.
    pub fn handle_data(&mut self, data: &str) -> Vec<String> {
        if data.trim() == "[DONE]" {
            return Vec::new();
        }
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };

        match event.get("type").and_then(|t| t.as_str()) {
            Some("response.output_text.delta") => {
                let Some(delta) = event.get("delta").and_then(|d| d.as_str()) else {
                    return Vec::new();
                };
                vec![self.chunk(json!({ "content": delta }), None)]
            }
            Some("response.output_tool_call.delta") => {
                let Some(call_id) = event.get("call_id").and_then(|c| c.as_str()) else {
                    return Vec::new();
                };
                let next_index = self.calls.len();
                let slot = self
                    .calls
                    .entry(call_id.to_owned())
                    .or_insert(ToolCallSlot { index: next_index, name_sent: false });

                let mut function = serde_json::Map::new();
                if !slot.name_sent {
                    if let Some(name) = event.get("name").and_then(|n| n.as_str()) {
                        function.insert("name".to_owned(), Value::String(name.to_owned()));
                        slot.name_sent = true;
                    }
                }
                if let Some(arguments) = event.get("arguments").and_then(|a| a.as_str()) {
                    // Raw fragment, exactly as upstream sent it.
                    function.insert("arguments".to_owned(), Value::String(arguments.to_owned()));
                }

                let tool_call = json!({
                    "index": slot.index,
                    "id": call_id,
                    "type": "function",
                    "function": Value::Object(function),
                });
                vec![self.chunk(json!({ "tool_calls": [tool_call] }), None)]
            }
            Some("response.completed") => self.finish(),
            _ => Vec::new(),
        }
    }

    fn finish(&mut self) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![self.chunk(json!({}), Some(self.finish_reason())), DONE_FRAME.to_owned()]
    }

    /// Upstream ended without `response.completed`; close the stream anyway.
    pub fn end_of_stream(&mut self) -> Vec<String> {
        self.finish()
    }
}

/// Re-frame an upstream byte stream as a chat-completion SSE byte stream.
pub fn chat_sse_stream<S, E>(upstream: S, model: &str) -> impl Stream<Item = Result<Bytes, E>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Send + 'static,
{
    struct Ctx<S> {
        upstream: std::pin::Pin<Box<S>>,
        parser: SseParser,
        translator: ChatTranslator,
        pending: VecDeque<Bytes>,
        done: bool,
    }

    let ctx = Ctx {
        upstream: Box::pin(upstream),
        parser: SseParser::default(),
        translator: ChatTranslator::new(model),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(ctx, |mut ctx| async move {
        loop {
            if let Some(frame) = ctx.pending.pop_front() {
                return Some((Ok(frame), ctx));
            }
            if ctx.done {
                return None;
            }
            match ctx.upstream.next().await {
                Some(Ok(bytes)) => {
                    for data in ctx.parser.push(&bytes) {
                        for frame in ctx.translator.handle_data(&data) {
                            ctx.pending.push_back(Bytes::from(frame));
                        }
                    }
                }
                Some(Err(e)) => {
                    ctx.done = true;
                    return Some((Err(e), ctx));
                }
                None => {
                    ctx.done = true;
                    for frame in ctx.translator.end_of_stream() {
                        ctx.pending.push_back(Bytes::from(frame));
                    }
                }
            }
        }
    })
}

struct ToolCallAggregate {
    name: Option<String>,
    arguments: String,
}

/// Batch variant: consume the whole event stream and aggregate one
/// chat-completion object. Argument fragments concatenate in event order per
/// `call_id` and are returned verbatim.
pub struct ChatAggregator {
    model: String,
    completion_id: String,
    created: u64,
    content: String,
    calls: IndexMap<String, ToolCallAggregate>,
}

impl ChatAggregator {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_owned(),
            completion_id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: epoch_secs(),
            content: String::new(),
            calls: IndexMap::new(),
        }
    }

    pub fn handle_data(&mut self, data: &str) {
        if data.trim() == "[DONE]" {
            return;
        }
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return;
        };
        match event.get("type").and_then(|t| t.as_str()) {
            Some("response.output_text.delta") => {
                if let Some(delta) = event.get("delta").and_then(|d| d.as_str()) {
                    self.content.push_str(delta);
                }
            }
            Some("response.output_tool_call.delta") => {
                let Some(call_id) = event.get("call_id").and_then(|c| c.as_str()) else {
                    return;
                };
                let call = self
                    .calls
                    .entry(call_id.to_owned())
                    .or_insert(ToolCallAggregate { name: None, arguments: String::new() });
                if call.name.is_none() {
                    if let Some(name) = event.get("name").and_then(|n| n.as_str()) {
                        call.name = Some(name.to_owned());
                    }
                }
                if let Some(arguments) = event.get("arguments").and_then(|a| a.as_str()) {
                    call.arguments.push_str(arguments);
                }
            }
            _ => {}
        }
    }

    pub fn into_completion(self) -> Value {
        let finish_reason = if self.calls.is_empty() { "stop" } else { "tool_calls" };
        let tool_calls: Vec<Value> = self
            .calls
            .iter()
            .map(|(call_id, call)| {
                json!({
                    "id": call_id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.arguments,
                    },
                })
            })
            .collect();

        let mut message = serde_json::Map::new();
        message.insert("role".to_owned(), json!("assistant"));
        message.insert(
            "content".to_owned(),
            if self.content.is_empty() { Value::Null } else { Value::String(self.content) },
        );
        if !tool_calls.is_empty() {
            message.insert("tool_calls".to_owned(), Value::Array(tool_calls));
        }

        json!({
            "id": self.completion_id,
            "object": "chat.completion",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "message": Value::Object(message),
                "finish_reason": finish_reason,
            }],
        })
    }
}

/// Consume an upstream byte stream fully and return the aggregated object.
pub async fn collect_chat_completion<S, E>(upstream: S, model: &str) -> Result<Value, E>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    let mut parser = SseParser::default();
    let mut aggregator = ChatAggregator::new(model);
    let mut upstream = std::pin::pin!(upstream);
    while let Some(chunk) = upstream.next().await {
        for data in parser.push(&chunk?) {
            aggregator.handle_data(&data);
        }
    }
    Ok(aggregator.into_completion())
}

#[cfg(test)]
#[path = "chat_tests.rs"]
mod tests;
