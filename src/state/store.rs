// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-owner state records.
//!
//! Reads never lock; writes are read-modify-write under the owner's
//! [`StateLock`] and land through a temp file and rename.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use super::lock::StateLock;
use crate::error::Result;
use crate::events::{topics, EventDispatcher, EventPayload};
use crate::paths::{BusPaths, TierOwner};

pub const STATUS_IDLE: &str = "idle";
pub const STATUS_PROCESSING: &str = "processing";

/// A domain's handoff sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRecord {
    pub participants: Vec<String>,
    /// Index of the participant currently holding the work.
    pub cursor: usize,
    #[serde(default)]
    pub complete: bool,
}

impl WorkflowRecord {
    pub fn new(participants: Vec<String>) -> Self {
        Self {
            participants,
            cursor: 0,
            complete: false,
        }
    }

    pub fn current(&self) -> Option<&str> {
        self.participants.get(self.cursor).map(String::as_str)
    }

    pub fn next(&self) -> Option<&str> {
        self.participants.get(self.cursor + 1).map(String::as_str)
    }

    pub fn is_last(&self) -> bool {
        self.cursor + 1 >= self.participants.len()
    }
}

/// The state record of one tier owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerState {
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub current_participant: Option<String>,
    #[serde(default)]
    pub previous_participant: Option<String>,
    #[serde(default)]
    pub workflow: Option<WorkflowRecord>,
    #[serde(default)]
    pub completed_tasks: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Fields written by other tools are carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_status() -> String {
    STATUS_IDLE.to_string()
}

impl Default for OwnerState {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            status: default_status(),
            current_participant: None,
            previous_participant: None,
            workflow: None,
            completed_tasks: 0,
            created_at: now,
            updated_at: now,
            extra: Map::new(),
        }
    }
}

/// A shallow patch: each key replaces the stored value wholesale.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch(Map<String, Value>);

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn status(self, status: &str) -> Self {
        self.set("status", status)
    }

    pub fn current_participant(self, participant: Option<&str>) -> Self {
        self.set("currentParticipant", participant.map(Value::from).unwrap_or(Value::Null))
    }

    pub fn previous_participant(self, participant: Option<&str>) -> Self {
        self.set("previousParticipant", participant.map(Value::from).unwrap_or(Value::Null))
    }

    pub fn workflow(self, workflow: &WorkflowRecord) -> Self {
        let value = serde_json::to_value(workflow).unwrap_or(Value::Null);
        self.set("workflow", value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for StatePatch {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Reads and writes owner state records.
pub struct StateStore {
    paths: BusPaths,
    dispatcher: Arc<EventDispatcher>,
    lock_timeout: Duration,
    stale_after: Duration,
}

impl StateStore {
    pub fn new(
        paths: BusPaths,
        dispatcher: Arc<EventDispatcher>,
        lock_timeout: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            paths,
            dispatcher,
            lock_timeout,
            stale_after,
        }
    }

    /// Read an owner's record, creating the default record on first access.
    pub fn read(&self, owner: &TierOwner) -> Result<OwnerState> {
        let path = self.paths.state_path(owner);
        match read_map(&path)? {
            Some(map) => Ok(serde_json::from_value(Value::Object(map))?),
            None => {
                let state = OwnerState::default();
                if let Err(e) = write_if_absent(&path, &serde_json::to_value(&state)?) {
                    debug!(owner = %owner, "Default state not persisted: {}", e);
                }
                Ok(state)
            }
        }
    }

    /// Shallow-merge `patch` over the stored record under the owner's lock.
    #[instrument(skip(self, patch), fields(owner = %owner))]
    pub async fn update(&self, owner: &TierOwner, patch: StatePatch) -> Result<OwnerState> {
        let state = {
            let _lock = StateLock::acquire(
                &self.paths.lock_path(owner),
                self.lock_timeout,
                self.stale_after,
            )
            .await?;

            let path = self.paths.state_path(owner);
            let mut record = match read_map(&path)? {
                Some(map) => map,
                None => match serde_json::to_value(OwnerState::default())? {
                    Value::Object(map) => map,
                    _ => Map::new(),
                },
            };
            for (key, value) in patch.into_map() {
                record.insert(key, value);
            }
            record.insert("updatedAt".to_string(), serde_json::to_value(Utc::now())?);

            let value = Value::Object(record);
            let state: OwnerState = serde_json::from_value(value.clone())?;
            write_atomic(&path, &value)?;
            state
        };

        self.dispatcher.publish(
            topics::STATE_CHANGED,
            EventPayload::StateChanged {
                owner: owner.clone(),
                status: Some(state.status.clone()),
            },
        );
        Ok(state)
    }

    /// Add `amount` to a numeric field.
    ///
    /// The read and the update are two steps; a concurrent writer in another
    /// process can interleave between them.
    pub async fn increment(&self, owner: &TierOwner, key: &str, amount: i64) -> Result<OwnerState> {
        let path = self.paths.state_path(owner);
        let current = read_map(&path)?
            .and_then(|map| map.get(key).and_then(Value::as_i64))
            .unwrap_or(0);
        self.update(owner, StatePatch::new().set(key, current + amount))
            .await
    }
}

fn read_map(path: &Path) -> Result<Option<Map<String, Value>>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_str(&content)? {
        Value::Object(map) => Ok(Some(map)),
        _ => Ok(None),
    }
}

fn write_atomic(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Create `path` with `value` unless it already exists. Runs without the
/// lock, so it must never replace a record written by `update`: the content
/// goes to a private temp file that is hard-linked into place, which fails
/// if the target exists.
fn write_if_absent(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
    let linked = std::fs::hard_link(&tmp, path);
    let _ = std::fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}
