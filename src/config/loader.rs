// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Locating and reading bus configuration files.
//!
//! A workspace may carry one of [`WORKSPACE_FILES`]; the first that exists
//! is used. A per-user file under `~/.meshbus/` sits underneath it.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ConfigError;

use super::types::WorkspaceConfig;

/// Workspace config candidates, in lookup order.
pub const WORKSPACE_FILES: &[&str] = &[
    "meshbus.json",
    ".meshbus/config.json",
    "meshbus.yaml",
    "meshbus.yml",
];

const USER_DIR: &str = ".meshbus";
const USER_FILE: &str = "config.json";

/// Serialization of a config file, chosen by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("json") => Ok(Self::Json),
            Some("yaml") | Some("yml") => Ok(Self::Yaml),
            _ => Err(ConfigError::InvalidFormat(format!(
                "{}: expected .json, .yaml or .yml",
                path.display()
            ))),
        }
    }
}

/// A config layer together with the file it came from.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub path: PathBuf,
    pub config: WorkspaceConfig,
}

/// `~/.meshbus/config.json`, when a home directory is known.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(USER_DIR).join(USER_FILE))
}

/// Parse one config file.
pub fn read_config_file(path: &Path) -> Result<WorkspaceConfig, ConfigError> {
    let format = ConfigFormat::from_path(path)?;
    let content = std::fs::read_to_string(path)?;
    let config = match format {
        ConfigFormat::Json => serde_json::from_str(&content)?,
        ConfigFormat::Yaml => serde_yaml::from_str(&content)?,
    };
    debug!(path = %path.display(), "Loaded config file");
    Ok(config)
}

/// The per-user layer, if present.
pub fn discover_user_config() -> Result<Option<ConfigFile>, ConfigError> {
    match user_config_path() {
        Some(path) if path.is_file() => read_layer(path).map(Some),
        _ => Ok(None),
    }
}

/// The workspace layer, if `workspace_root` carries one.
pub fn discover_workspace_config(workspace_root: &Path) -> Result<Option<ConfigFile>, ConfigError> {
    match workspace_config_path(workspace_root) {
        Some(path) => read_layer(path).map(Some),
        None => Ok(None),
    }
}

fn workspace_config_path(dir: &Path) -> Option<PathBuf> {
    WORKSPACE_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

fn read_layer(path: PathBuf) -> Result<ConfigFile, ConfigError> {
    let config = read_config_file(&path)?;
    Ok(ConfigFile { path, config })
}

/// Nearest ancestor of `start` (inclusive) holding a workspace config file.
pub fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| workspace_config_path(dir).is_some())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_user_config_path() {
        let path = user_config_path().unwrap();
        assert!(path.ends_with(".meshbus/config.json"));
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.JSON")).unwrap(), ConfigFormat::Json);
        assert_eq!(ConfigFormat::from_path(Path::new("a.yml")).unwrap(), ConfigFormat::Yaml);
        assert!(matches!(
            ConfigFormat::from_path(Path::new("a.toml")),
            Err(ConfigError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_no_workspace_config() {
        let temp = TempDir::new().unwrap();
        assert!(discover_workspace_config(temp.path()).unwrap().is_none());
    }

    #[test]
    fn test_workspace_json() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("meshbus.json"),
            r#"{"fallbackParticipant": "lead", "lockTimeoutMs": 100}"#,
        )
        .unwrap();

        let layer = discover_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(layer.path, temp.path().join("meshbus.json"));
        assert_eq!(layer.config.fallback_participant, Some("lead".to_string()));
        assert_eq!(layer.config.lock_timeout_ms, Some(100));
    }

    #[test]
    fn test_json_wins_over_yaml() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("meshbus.json"), r#"{"resetCommand": "/new"}"#).unwrap();
        std::fs::write(temp.path().join("meshbus.yaml"), "resetCommand: /reset\n").unwrap();

        let layer = discover_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(layer.config.reset_command, Some("/new".to_string()));
    }

    #[test]
    fn test_workspace_yaml() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("meshbus.yaml"),
            "root: bus\ndelivery:\n  idleWindowMs: 750\n",
        )
        .unwrap();

        let config = discover_workspace_config(temp.path()).unwrap().unwrap().config;
        assert_eq!(config.root, Some(PathBuf::from("bus")));
        assert_eq!(config.delivery.unwrap().idle_window_ms, Some(750));
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("meshbus.json"), "{ nope").unwrap();
        assert!(matches!(
            discover_workspace_config(temp.path()),
            Err(ConfigError::JsonError(_))
        ));
    }

    #[test]
    fn test_find_workspace_root_from_subdir() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(".meshbus")).unwrap();
        std::fs::write(temp.path().join(".meshbus/config.json"), "{}").unwrap();

        let subdir = temp.path().join("a").join("b");
        std::fs::create_dir_all(&subdir).unwrap();
        assert_eq!(find_workspace_root(&subdir).unwrap(), temp.path());
    }
}
