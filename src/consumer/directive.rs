// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Header directives that change how a message is delivered.

use std::fmt;

use crate::message::Message;

pub const SELF_MODIFY: &str = "self-modify";
pub const CLEAR_CONTEXT: &str = "clear-context";
pub const LENS: &str = "lens";

/// The one delivery path a message takes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Rewrite with `templates/<name>.md`, reset the session, deliver as a prompt.
    SelfModify(String),
    /// Reset the session, then deliver.
    ClearContext,
    /// Prepend the named lens block, then deliver.
    Lens(String),
    Plain,
}

impl Directive {
    /// Pick the directive. Precedence: self-modify, clear-context, lens.
    pub fn from_message(message: &Message) -> Self {
        let named = |key: &str| {
            message
                .field(key)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        if let Some(template) = named(SELF_MODIFY) {
            return Self::SelfModify(template);
        }
        if message.flag(CLEAR_CONTEXT) {
            return Self::ClearContext;
        }
        if let Some(lens) = named(LENS) {
            return Self::Lens(lens);
        }
        Self::Plain
    }

    /// Whether the session is reset before delivery.
    pub fn resets(&self) -> bool {
        matches!(self, Self::SelfModify(_) | Self::ClearContext)
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelfModify(t) => write!(f, "self-modify({})", t),
            Self::ClearContext => f.write_str("clear-context"),
            Self::Lens(l) => write!(f, "lens({})", l),
            Self::Plain => f.write_str("plain"),
        }
    }
}

/// Fill `{{body}}`, `{{from}}`, `{{to}}` and `{{msg_id}}` in a template.
///
/// One pass over the template: substituted text is never scanned again, so
/// a body quoting `{{from}}` arrives verbatim.
pub fn render_template(template: &str, message: &Message) -> String {
    let fields = [
        ("{{body}}", message.body.as_str()),
        ("{{from}}", message.from.as_str()),
        ("{{to}}", message.to.as_str()),
        ("{{msg_id}}", message.msg_id.as_deref().unwrap_or("")),
    ];
    let mut out = String::with_capacity(template.len() + message.body.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        rest = &rest[start..];
        match fields.iter().find(|(key, _)| rest.starts_with(key)) {
            Some((key, value)) => {
                out.push_str(value);
                rest = &rest[key.len()..];
            }
            None => {
                out.push_str("{{");
                rest = &rest[2..];
            }
        }
    }
    out.push_str(rest);
    out
}
