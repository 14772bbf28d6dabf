// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persisted consumer cursor.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Position in the shared log: creation instant, then filename.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor {
    pub timestamp: DateTime<Utc>,
    pub file: String,
}

impl Cursor {
    pub fn new(timestamp: DateTime<Utc>, file: impl Into<String>) -> Self {
        Self {
            timestamp,
            file: file.into(),
        }
    }
}

/// `offsets/<domain>.<participant>.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OffsetRecord {
    #[serde(default)]
    pub consumer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_file: Option<String>,
    #[serde(default)]
    pub processed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Files that could not be delivered yet. They stay pending even once
    /// the cursor has moved past them.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub held: BTreeSet<String>,
}

impl OffsetRecord {
    pub fn new(consumer: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
            ..Default::default()
        }
    }

    /// Load a record; a missing file is a fresh consumer.
    pub fn load(path: &Path, consumer: &str) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::new(consumer));
            }
            Err(e) => return Err(e.into()),
        };
        let mut record: Self = serde_json::from_str(&content)?;
        if record.consumer.is_empty() {
            record.consumer = consumer.to_string();
        }
        Ok(record)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn cursor(&self) -> Option<Cursor> {
        // Records written without a filename sort before any file of that second.
        self.last_timestamp
            .map(|ts| Cursor::new(ts, self.last_file.clone().unwrap_or_default()))
    }

    /// Whether a message at `position` is at or before the cursor.
    pub fn covers(&self, position: &Cursor) -> bool {
        match self.cursor() {
            Some(cursor) => position.cmp(&cursor) != Ordering::Greater,
            None => false,
        }
    }

    /// Whether a message at `position` needs no further delivery.
    pub fn is_done(&self, position: &Cursor) -> bool {
        self.covers(position) && !self.held.contains(&position.file)
    }

    /// Keep `position` pending past later cursor moves. Returns false if it
    /// was already held.
    pub fn hold(&mut self, position: &Cursor) -> bool {
        self.held.insert(position.file.clone())
    }

    /// Record a delivery at `position`: release it if held and move the
    /// cursor forward to it. Never moves the cursor back. Returns whether
    /// anything changed.
    pub fn advance(&mut self, position: &Cursor) -> bool {
        let released = self.held.remove(&position.file);
        if self.covers(position) {
            if released {
                self.processed += 1;
                self.updated_at = Some(Utc::now());
            }
            return released;
        }
        self.last_timestamp = Some(position.timestamp);
        self.last_file = Some(position.file.clone());
        self.processed += 1;
        self.updated_at = Some(Utc::now());
        true
    }
}
