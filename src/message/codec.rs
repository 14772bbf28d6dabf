// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Header/body codec for message files.
//!
//! ```text
//! ---
//! from: mesh-a/planner
//! to: builder
//! type: task
//! status: pending
//! msg-id: 1a2b3c4d
//! timestamp: 2026-10-17T09:30:00Z
//! ---
//!
//! Markdown body...
//! ```
//!
//! The header is line-oriented `key: value` text, not YAML.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, NaiveDateTime, Utc};

use super::types::{Message, MessageType};
use crate::error::CodecError;

/// Header separator line.
pub const SEPARATOR: &str = "---";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Render a message to file contents.
///
/// Core fields come first in a fixed order, extension fields follow sorted
/// by key, so encoding is stable.
pub fn encode(message: &Message) -> String {
    let mut out = String::with_capacity(message.body.len() + 160);
    out.push_str(SEPARATOR);
    out.push('\n');
    let _ = writeln!(out, "from: {}", message.from);
    let _ = writeln!(out, "to: {}", message.to);
    let _ = writeln!(out, "type: {}", message.kind);
    if let Some(status) = &message.status {
        let _ = writeln!(out, "status: {}", status);
    }
    if let Some(id) = &message.msg_id {
        let _ = writeln!(out, "msg-id: {}", id);
    }
    if let Some(ts) = &message.timestamp {
        let _ = writeln!(out, "timestamp: {}", ts.format(TIMESTAMP_FORMAT));
    }
    for (key, value) in &message.extra {
        let _ = writeln!(out, "{}: {}", key, value.replace('\n', " "));
    }
    out.push_str(SEPARATOR);
    out.push_str("\n\n");
    out.push_str(&message.body);
    out
}

/// Parse file contents into a message.
///
/// Only a missing separator is a hard failure; absent or malformed fields
/// are left for [`Message::validate`] to report.
pub fn decode(text: &str) -> Result<Message, CodecError> {
    let (header, body) = split_sections(text)?;
    let mut fields = BTreeMap::new();
    for line in header.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        fields.insert(key.to_string(), value.trim().to_string());
    }

    let mut take = |key: &str| fields.remove(key).filter(|v| !v.is_empty());
    let from = take("from").unwrap_or_default();
    let to = take("to").unwrap_or_default();
    let kind = MessageType::from(take("type").unwrap_or_default().as_str());
    let status = take("status");
    let msg_id = take("msg-id");
    let timestamp = take("timestamp").and_then(|raw| parse_timestamp(&raw));

    Ok(Message {
        from,
        to,
        kind,
        status,
        msg_id,
        timestamp,
        extra: fields,
        body: body.to_string(),
    })
}

/// Split into (header, body) on the first two separator lines.
fn split_sections(text: &str) -> Result<(&str, &str), CodecError> {
    let mut offset = 0;
    let mut header_start = None;
    for line in text.split_inclusive('\n') {
        let end = offset + line.len();
        if line.trim_end() == SEPARATOR {
            match header_start {
                None => header_start = Some(end),
                Some(start) => {
                    let header = &text[start..offset];
                    let rest = &text[end..];
                    let body = rest
                        .strip_prefix("\r\n")
                        .or_else(|| rest.strip_prefix('\n'))
                        .unwrap_or(rest);
                    return Ok((header, body));
                }
            }
        }
        offset = end;
    }
    Err(CodecError::MissingSeparator)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}
