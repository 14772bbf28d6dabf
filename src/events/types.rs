// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Event payloads and topic names.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::message::MessageType;
use crate::paths::{PathLocation, Tier, TierOwner};

/// Topic names published by the bus.
pub mod topics {
    use crate::paths::Tier;

    /// A new message in the shared log.
    pub const LOG: &str = "message:log";
    /// Owner state record changed.
    pub const STATE_CHANGED: &str = "state:changed";
    /// An active message was completed.
    pub const TASK_COMPLETED: &str = "task:completed";
    /// A workflow handed off to its next participant.
    pub const WORKFLOW_ADVANCED: &str = "workflow:advanced";
    /// A workflow reached its last participant.
    pub const WORKFLOW_COMPLETE: &str = "workflow:complete";
    /// Matches every tier arrival.
    pub const ANY_MESSAGE: &str = "message:*";

    /// Topic for a new file in a tier, e.g. `message:inbox`.
    pub fn message(tier: Tier) -> String {
        format!("message:{}", tier.dir_name())
    }
}

/// Where the watch layer believes a message should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingHint {
    /// Resolved domain, when one could be determined.
    pub domain: Option<String>,
    pub participant: String,
}

/// A message file that appeared on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrivedMessage {
    pub path: PathBuf,
    pub location: PathLocation,
    pub from: String,
    pub to: String,
    pub kind: MessageType,
    pub msg_id: String,
    pub hint: RoutingHint,
}

impl ArrivedMessage {
    /// Owner and tier when the file landed in a tier directory.
    pub fn tier(&self) -> Option<(&TierOwner, Tier)> {
        match &self.location {
            PathLocation::Tier { owner, tier, .. } => Some((owner, *tier)),
            PathLocation::Log { .. } => None,
        }
    }

    pub fn file_name(&self) -> &str {
        match &self.location {
            PathLocation::Tier { file, .. } | PathLocation::Log { file } => file,
        }
    }
}

/// Event payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    MessageArrived(ArrivedMessage),
    StateChanged {
        owner: TierOwner,
        status: Option<String>,
    },
    TaskCompleted {
        owner: TierOwner,
        file: String,
    },
    WorkflowAdvanced {
        domain: String,
        from: String,
        to: String,
        cursor: usize,
    },
    WorkflowComplete {
        domain: String,
    },
    Custom(serde_json::Value),
}

/// A published event.
#[derive(Debug, Clone, PartialEq)]
pub struct BusEvent {
    pub topic: String,
    pub payload: EventPayload,
    pub at: DateTime<Utc>,
}

impl BusEvent {
    pub fn new(topic: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            topic: topic.into(),
            payload,
            at: Utc::now(),
        }
    }
}
