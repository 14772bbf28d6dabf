// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lens index: named perspective blocks prepended to a message body.
//!
//! `lenses.json` maps a lens name either to its text or to an object:
//!
//! ```json
//! {
//!   "security": "Review everything below as an attacker would.",
//!   "perf": { "title": "Performance", "perspective": "Count the allocations." }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LensEntry {
    Text(String),
    Detailed {
        #[serde(default)]
        title: Option<String>,
        perspective: String,
    },
}

/// A resolved lens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lens {
    pub name: String,
    pub title: String,
    pub perspective: String,
}

impl Lens {
    /// The body with this lens's block in front of it.
    pub fn apply(&self, body: &str) -> String {
        format!(
            "## Lens: {}\n\n{}\n\n---\n\n{}",
            self.title,
            self.perspective.trim(),
            body
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LensIndex {
    entries: BTreeMap<String, LensEntry>,
}

impl LensIndex {
    /// Load the index; a missing file is an empty index.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, name: &str) -> Option<Lens> {
        let (title, perspective) = match self.entries.get(name)? {
            LensEntry::Text(text) => (name.to_string(), text.clone()),
            LensEntry::Detailed { title, perspective } => (
                title.clone().unwrap_or_else(|| name.to_string()),
                perspective.clone(),
            ),
        };
        Some(Lens {
            name: name.to_string(),
            title,
            perspective,
        })
    }

    pub fn insert(&mut self, name: impl Into<String>, entry: LensEntry) {
        self.entries.insert(name.into(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
