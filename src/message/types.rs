// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Message, address and message-type definitions.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};

use crate::error::CodecError;

// ============================================================================
// Address
// ============================================================================

/// A message address.
///
/// Either a bare identifier (a participant in the sender's domain, or a
/// domain name resolved to its default participant) or an explicit
/// `domain/participant` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    /// Domain part, present only for two-part addresses.
    pub domain: Option<String>,
    /// The participant (or, for bare addresses, the ambiguous identifier).
    pub name: String,
}

impl Address {
    /// A bare, single-identifier address.
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            domain: None,
            name: name.into(),
        }
    }

    /// An explicit `domain/participant` address.
    pub fn qualified(domain: impl Into<String>, participant: impl Into<String>) -> Self {
        Self {
            domain: Some(domain.into()),
            name: participant.into(),
        }
    }

    /// Parse the header form (`name` or `domain/participant`).
    pub fn parse(raw: &str) -> Result<Self, CodecError> {
        Self::parse_with(raw, '/')
    }

    /// Parse the filename form (`name` or `domain.participant`).
    pub fn parse_token(raw: &str) -> Result<Self, CodecError> {
        Self::parse_with(raw, '.')
    }

    fn parse_with(raw: &str, separator: char) -> Result<Self, CodecError> {
        let raw = raw.trim();
        let address = match raw.split_once(separator) {
            Some((domain, participant)) => Self::qualified(domain, participant),
            None => Self::bare(raw),
        };
        let domain_ok = address.domain.as_deref().map_or(true, is_valid_ident);
        if !domain_ok || !is_valid_ident(&address.name) {
            return Err(CodecError::InvalidAddress(raw.to_string()));
        }
        Ok(address)
    }

    /// Render the filename token for this address.
    pub fn to_token(&self) -> String {
        match &self.domain {
            Some(domain) => format!("{}.{}", domain, self.name),
            None => self.name.clone(),
        }
    }

    /// Whether this is an explicit `domain/participant` address.
    pub fn is_qualified(&self) -> bool {
        self.domain.is_some()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.domain {
            Some(domain) => write!(f, "{}/{}", domain, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Identifiers are non-empty ASCII alphanumerics, hyphen and underscore.
pub fn is_valid_ident(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// ============================================================================
// Message type
// ============================================================================

/// Kind of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    Task,
    TaskComplete,
    Ask,
    AskResponse,
    Update,
    Prompt,
    /// Domain-specific variant not known to the bus.
    Other(String),
}

impl MessageType {
    /// Known types, longest first so hyphenated names win prefix matches.
    pub const KNOWN: &'static [MessageType] = &[
        MessageType::TaskComplete,
        MessageType::AskResponse,
        MessageType::Update,
        MessageType::Prompt,
        MessageType::Task,
        MessageType::Ask,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::Task => "task",
            Self::TaskComplete => "task-complete",
            Self::Ask => "ask",
            Self::AskResponse => "ask-response",
            Self::Update => "update",
            Self::Prompt => "prompt",
            Self::Other(name) => name,
        }
    }

    /// Whether the type belongs to the bus's known set.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }

    /// Task and ask messages must carry a `msg-id`.
    pub fn requires_msg_id(&self) -> bool {
        matches!(self, Self::Task | Self::Ask)
    }
}

impl From<&str> for MessageType {
    fn from(raw: &str) -> Self {
        match raw.trim() {
            "task" => Self::Task,
            "task-complete" => Self::TaskComplete,
            "ask" => Self::Ask,
            "ask-response" => Self::AskResponse,
            "update" => Self::Update,
            "prompt" => Self::Prompt,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Message
// ============================================================================

/// A single addressed message, as stored in one file.
///
/// Addresses are kept in their raw header form so that a message with
/// suspect metadata can still be carried to its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub from: String,
    pub to: String,
    pub kind: MessageType,
    pub status: Option<String>,
    pub msg_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Extension header fields, kept key-ordered.
    pub extra: BTreeMap<String, String>,
    pub body: String,
}

impl Message {
    /// Create a new message stamped now, with a fresh message id.
    pub fn new(kind: MessageType, from: &Address, to: &Address, body: impl Into<String>) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            kind,
            status: Some("pending".to_string()),
            msg_id: Some(generate_msg_id()),
            timestamp: Some(Utc::now().trunc_subsecs(0)),
            extra: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Set the status field.
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Set an extension header field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Look up an extension header field.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }

    /// Whether a boolean-ish extension field is set.
    pub fn flag(&self, key: &str) -> bool {
        matches!(
            self.field(key).map(str::to_ascii_lowercase).as_deref(),
            Some("true" | "yes" | "1")
        )
    }

    pub fn from_address(&self) -> Result<Address, CodecError> {
        Address::parse(&self.from)
    }

    pub fn to_address(&self) -> Result<Address, CodecError> {
        Address::parse(&self.to)
    }

    /// Header as flat key/value pairs, for diagnostics.
    pub fn header_fields(&self) -> BTreeMap<String, String> {
        let mut fields = self.extra.clone();
        fields.insert("from".to_string(), self.from.clone());
        fields.insert("to".to_string(), self.to.clone());
        fields.insert("type".to_string(), self.kind.to_string());
        if let Some(status) = &self.status {
            fields.insert("status".to_string(), status.clone());
        }
        if let Some(id) = &self.msg_id {
            fields.insert("msg-id".to_string(), id.clone());
        }
        fields
    }

    /// Schema-only validation. Issues are warnings; they never block delivery.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for (field, value) in [("from", &self.from), ("to", &self.to)] {
            if value.trim().is_empty() {
                issues.push(ValidationIssue::MissingField(field));
            } else if Address::parse(value).is_err() {
                issues.push(ValidationIssue::InvalidAddress {
                    field,
                    value: value.clone(),
                });
            }
        }
        match &self.kind {
            MessageType::Other(name) if name.is_empty() => {
                issues.push(ValidationIssue::MissingField("type"))
            }
            MessageType::Other(name) => issues.push(ValidationIssue::UnknownType(name.clone())),
            _ => {}
        }
        if self.kind.requires_msg_id()
            && self.msg_id.as_deref().map_or(true, |id| id.trim().is_empty())
        {
            issues.push(ValidationIssue::MissingMsgId);
        }
        if self.timestamp.is_none() {
            issues.push(ValidationIssue::MissingField("timestamp"));
        }
        issues
    }
}

/// Generate an 8-character hex message id (never hyphenated).
pub fn generate_msg_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// A header problem found by [`Message::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    MissingField(&'static str),
    UnknownType(String),
    MissingMsgId,
    InvalidAddress { field: &'static str, value: String },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField(field) => write!(f, "missing required field `{}`", field),
            Self::UnknownType(name) => write!(f, "unknown message type `{}`", name),
            Self::MissingMsgId => write!(f, "missing `msg-id` for a task/ask message"),
            Self::InvalidAddress { field, value } => {
                write!(f, "malformed `{}` address `{}`", field, value)
            }
        }
    }
}
