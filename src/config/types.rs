// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! [`WorkspaceConfig`] is what a file on disk may contain (every field
//! optional); [`BusConfig`] is the resolved configuration the bus runs on.
//! [`DomainConfig`] is the per-domain file consulted by routing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::paths::BusPaths;

/// Workspace configuration, as found in `meshbus.json` or `meshbus.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    /// Bus root directory, relative to the workspace root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Participant used when a bare domain address has no configured default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_participant: Option<String>,

    /// Session name template with `{domain}` and `{participant}` placeholders
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_template: Option<String>,

    /// Text injected to clear a session's context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_command: Option<String>,

    /// tmux executable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmux_binary: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_lock_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_ttl_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_window_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_poll_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryTimingsPartial>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_max_lines: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_history: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stuck_after_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stuck_check_secs: Option<u64>,

    /// Whether to run the shared-log consumers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumers: Option<bool>,
}

/// Delivery pacing as it may appear in a config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryTimingsPartial {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settle_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_window_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
}

/// Pacing for injections into a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryTimings {
    /// Pause between pasting and confirming an injection.
    pub settle_delay_ms: u64,
    /// How often the session output is sampled while waiting for idle.
    pub poll_interval_ms: u64,
    /// How long the output must stay unchanged to count as idle.
    pub idle_window_ms: u64,
    /// Upper bound on the idle wait; expiry is not an error.
    pub idle_timeout_ms: u64,
}

impl Default for DeliveryTimings {
    fn default() -> Self {
        Self {
            settle_delay_ms: 500,
            poll_interval_ms: 500,
            idle_window_ms: 2_000,
            idle_timeout_ms: 60_000,
        }
    }
}

impl DeliveryTimings {
    /// Short windows for tests.
    pub fn quick() -> Self {
        Self {
            settle_delay_ms: 0,
            poll_interval_ms: 5,
            idle_window_ms: 20,
            idle_timeout_ms: 500,
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn idle_window(&self) -> Duration {
        Duration::from_millis(self.idle_window_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Resolved bus configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    pub root: PathBuf,
    pub fallback_participant: String,
    pub session_template: String,
    pub reset_command: String,
    pub tmux_binary: String,
    pub lock_timeout_ms: u64,
    pub stale_lock_ms: u64,
    pub ignore_ttl_ms: u64,
    pub dedup_window_ms: u64,
    pub consumer_poll_ms: u64,
    pub delivery: DeliveryTimings,
    pub evidence_max_lines: usize,
    pub event_history: usize,
    pub stuck_after_secs: u64,
    pub stuck_check_secs: u64,
    pub consumers: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".meshbus"),
            fallback_participant: "coordinator".to_string(),
            session_template: "{domain}-{participant}".to_string(),
            reset_command: "/clear".to_string(),
            tmux_binary: "tmux".to_string(),
            lock_timeout_ms: 5_000,
            stale_lock_ms: 30_000,
            ignore_ttl_ms: 5_000,
            dedup_window_ms: 1_000,
            consumer_poll_ms: 2_000,
            delivery: DeliveryTimings::default(),
            evidence_max_lines: crate::evidence::DEFAULT_MAX_LINES,
            event_history: crate::events::DEFAULT_HISTORY,
            stuck_after_secs: 1_800,
            stuck_check_secs: 300,
            consumers: true,
        }
    }
}

impl BusConfig {
    /// Defaults rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Short timings for tests.
    pub fn quick(mut self) -> Self {
        self.lock_timeout_ms = 500;
        self.ignore_ttl_ms = 200;
        self.dedup_window_ms = 50;
        self.consumer_poll_ms = 50;
        self.delivery = DeliveryTimings::quick();
        self
    }

    pub fn paths(&self) -> BusPaths {
        BusPaths::new(self.root.clone())
    }

    /// Session name bound to a participant.
    pub fn session_name(&self, domain: &str, participant: &str) -> String {
        self.session_template
            .replace("{domain}", domain)
            .replace("{participant}", participant)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn stale_lock_age(&self) -> Duration {
        Duration::from_millis(self.stale_lock_ms)
    }

    pub fn ignore_ttl(&self) -> Duration {
        Duration::from_millis(self.ignore_ttl_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn consumer_poll_interval(&self) -> Duration {
        Duration::from_millis(self.consumer_poll_ms.max(1))
    }

    pub fn stuck_after(&self) -> Duration {
        Duration::from_secs(self.stuck_after_secs)
    }

    pub fn stuck_check_interval(&self) -> Duration {
        Duration::from_secs(self.stuck_check_secs.max(1))
    }
}

/// Per-domain configuration, `domains/<domain>/config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainConfig {
    /// Participants in the domain, in configured order.
    #[serde(default)]
    pub participants: Vec<String>,

    /// Participant that receives messages addressed to the bare domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,

    /// Handoff order for workflows; defaults to `participants`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<Vec<String>>,
}

impl DomainConfig {
    /// Load a domain's config. A missing file yields `None`.
    pub fn load(paths: &BusPaths, domain: &str) -> Result<Option<Self>, ConfigError> {
        Self::load_from(&paths.domain_config_path(domain))
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, paths: &BusPaths, domain: &str) -> Result<PathBuf, ConfigError> {
        let path = paths.domain_config_path(domain);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    /// Workflow order: the explicit list, else the participants.
    pub fn workflow_order(&self) -> Vec<String> {
        self.workflow
            .clone()
            .unwrap_or_else(|| self.participants.clone())
    }

    pub fn has_participant(&self, participant: &str) -> bool {
        self.participants.iter().any(|p| p == participant)
    }
}
