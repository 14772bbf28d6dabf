// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for meshbus.
//!
//! Handles loading and merging configuration from multiple sources:
//! - Global config: ~/.meshbus/config.json
//! - Workspace config: meshbus.json, .meshbus/config.json, meshbus.yaml or meshbus.yml
//! - CLI options: command-line arguments
//!
//! Configuration is merged with precedence (CLI > workspace > global > defaults).
//! Per-domain routing configuration lives next to each domain's queues and is
//! read on demand through [`DomainConfig`].

mod loader;
mod merger;
mod types;

pub use loader::{
    discover_user_config, discover_workspace_config, find_workspace_root, read_config_file,
    user_config_path, ConfigFile, ConfigFormat, WORKSPACE_FILES,
};

pub use merger::{merge_config, CliOptions};

pub use types::{BusConfig, DeliveryTimings, DeliveryTimingsPartial, DomainConfig, WorkspaceConfig};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Load and merge all configuration sources for a workspace.
///
/// `start` is searched upward for a workspace config; without one, `start`
/// itself is the workspace root. Relative roots resolve against it.
pub fn load_config(start: &Path, cli_options: CliOptions) -> Result<BusConfig, ConfigError> {
    let workspace_root = find_workspace_root(start).unwrap_or_else(|| start.to_path_buf());
    let user = discover_user_config()?;
    let workspace = discover_workspace_config(&workspace_root)?;

    Ok(merge_config(
        &workspace_root,
        user.map(|layer| layer.config),
        workspace.map(|layer| layer.config),
        cli_options,
    ))
}

/// Files that contributed to the configuration for `start`, lowest
/// precedence first.
pub fn config_sources(start: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let workspace_root = find_workspace_root(start).unwrap_or_else(|| start.to_path_buf());
    Ok([discover_user_config()?, discover_workspace_config(&workspace_root)?]
        .into_iter()
        .flatten()
        .map(|layer| layer.path)
        .collect())
}
