// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Handles merging configurations from different sources with proper precedence.

use std::path::{Path, PathBuf};

use super::types::{BusConfig, WorkspaceConfig};

/// CLI options that can override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub root: Option<PathBuf>,
    pub fallback_participant: Option<String>,
    pub session_template: Option<String>,
    pub idle_window_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub no_consumers: bool,
}

/// Merge configurations with precedence.
///
/// Precedence (highest to lowest):
/// 1. CLI options
/// 2. Workspace config (meshbus.json / meshbus.yaml)
/// 3. Global config (~/.meshbus/config.json)
/// 4. Default values
///
/// A relative root is resolved against `workspace_root`.
pub fn merge_config(
    workspace_root: &Path,
    global: Option<WorkspaceConfig>,
    workspace: Option<WorkspaceConfig>,
    cli: CliOptions,
) -> BusConfig {
    let mut result = BusConfig::default();

    if let Some(config) = global {
        apply_workspace_config(&mut result, &config);
    }

    if let Some(config) = workspace {
        apply_workspace_config(&mut result, &config);
    }

    apply_cli_options(&mut result, &cli);

    if result.root.is_relative() {
        result.root = workspace_root.join(&result.root);
    }
    result
}

fn apply_workspace_config(result: &mut BusConfig, config: &WorkspaceConfig) {
    if let Some(ref root) = config.root {
        result.root = root.clone();
    }
    if let Some(ref participant) = config.fallback_participant {
        result.fallback_participant = participant.clone();
    }
    if let Some(ref template) = config.session_template {
        result.session_template = template.clone();
    }
    if let Some(ref command) = config.reset_command {
        result.reset_command = command.clone();
    }
    if let Some(ref tmux) = config.tmux_binary {
        result.tmux_binary = tmux.clone();
    }
    if let Some(v) = config.lock_timeout_ms {
        result.lock_timeout_ms = v;
    }
    if let Some(v) = config.stale_lock_ms {
        result.stale_lock_ms = v;
    }
    if let Some(v) = config.ignore_ttl_ms {
        result.ignore_ttl_ms = v;
    }
    if let Some(v) = config.dedup_window_ms {
        result.dedup_window_ms = v;
    }
    if let Some(v) = config.consumer_poll_ms {
        result.consumer_poll_ms = v;
    }
    if let Some(ref delivery) = config.delivery {
        if let Some(v) = delivery.settle_delay_ms {
            result.delivery.settle_delay_ms = v;
        }
        if let Some(v) = delivery.poll_interval_ms {
            result.delivery.poll_interval_ms = v;
        }
        if let Some(v) = delivery.idle_window_ms {
            result.delivery.idle_window_ms = v;
        }
        if let Some(v) = delivery.idle_timeout_ms {
            result.delivery.idle_timeout_ms = v;
        }
    }
    if let Some(v) = config.evidence_max_lines {
        result.evidence_max_lines = v;
    }
    if let Some(v) = config.event_history {
        result.event_history = v;
    }
    if let Some(v) = config.stuck_after_secs {
        result.stuck_after_secs = v;
    }
    if let Some(v) = config.stuck_check_secs {
        result.stuck_check_secs = v;
    }
    if let Some(v) = config.consumers {
        result.consumers = v;
    }
}

fn apply_cli_options(result: &mut BusConfig, cli: &CliOptions) {
    if let Some(ref root) = cli.root {
        result.root = root.clone();
    }
    if let Some(ref participant) = cli.fallback_participant {
        result.fallback_participant = participant.clone();
    }
    if let Some(ref template) = cli.session_template {
        result.session_template = template.clone();
    }
    if let Some(v) = cli.idle_window_ms {
        result.delivery.idle_window_ms = v;
    }
    if let Some(v) = cli.idle_timeout_ms {
        result.delivery.idle_timeout_ms = v;
    }
    if cli.no_consumers {
        result.consumers = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::DeliveryTimingsPartial;

    #[test]
    fn test_merge_defaults() {
        let config = merge_config(Path::new("/ws"), None, None, CliOptions::default());
        assert_eq!(config.root, PathBuf::from("/ws/.meshbus"));
        assert_eq!(config.fallback_participant, "coordinator");
    }

    #[test]
    fn test_workspace_overrides_global() {
        let global = WorkspaceConfig {
            fallback_participant: Some("global".to_string()),
            lock_timeout_ms: Some(10),
            ..Default::default()
        };
        let workspace = WorkspaceConfig {
            fallback_participant: Some("local".to_string()),
            delivery: Some(DeliveryTimingsPartial {
                idle_window_ms: Some(99),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = merge_config(Path::new("/ws"), Some(global), Some(workspace), CliOptions::default());
        assert_eq!(config.fallback_participant, "local");
        assert_eq!(config.lock_timeout_ms, 10);
        assert_eq!(config.delivery.idle_window_ms, 99);
        assert_eq!(config.delivery.idle_timeout_ms, 60_000);
    }

    #[test]
    fn test_cli_wins() {
        let workspace = WorkspaceConfig {
            root: Some(PathBuf::from("bus")),
            consumers: Some(true),
            ..Default::default()
        };
        let cli = CliOptions {
            root: Some(PathBuf::from("/abs/bus")),
            idle_timeout_ms: Some(5),
            no_consumers: true,
            ..Default::default()
        };
        let config = merge_config(Path::new("/ws"), None, Some(workspace), cli);
        assert_eq!(config.root, PathBuf::from("/abs/bus"));
        assert_eq!(config.delivery.idle_timeout_ms, 5);
        assert!(!config.consumers);
    }
}
