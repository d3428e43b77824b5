// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SSE framing. Payloads are minified, ASCII-escaped JSON so byte-for-byte
//! output is stable regardless of the content's script.

use std::io;

use serde::Serialize;
use serde_json::ser::{Formatter, Serializer};

/// Frame one payload as an SSE event. A non-empty `type` field becomes the
/// `event:` line; otherwise only the data line is emitted.
pub fn format_sse_event(payload: &serde_json::Value) -> String {
    let data = to_ascii_json(payload);
    match payload.get("type").and_then(|v| v.as_str()) {
        Some(event_type) if !event_type.is_empty() => {
            format!("event: {event_type}\ndata: {data}\n\n")
        }
        _ => format!("data: {data}\n\n"),
    }
}

/// Serialize with compact separators, escaping non-ASCII as `\uXXXX`.
pub fn to_ascii_json(value: &serde_json::Value) -> String {
    let mut out = Vec::new();
    let mut ser = Serializer::with_formatter(&mut out, AsciiFormatter);
    if value.serialize(&mut ser).is_err() {
        return String::new();
    }
    String::from_utf8(out).unwrap_or_default()
}

/// Compact formatter that keeps string content in the ASCII range.
struct AsciiFormatter;

impl Formatter for AsciiFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut units = [0u16; 2];
        for ch in fragment.chars() {
            if ch.is_ascii() {
                writer.write_all(&[ch as u8])?;
            } else {
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }
}
