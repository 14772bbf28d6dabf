// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the message bus.
//!
//! Each concern gets its own `thiserror` enum; [`BusError`] is the bus-wide
//! error that components return. `anyhow` is only used at the binary boundary.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while encoding or decoding message files and filenames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Message header is not delimited by two separator lines")]
    MissingSeparator,

    #[error("Invalid message filename: {0}")]
    InvalidFilename(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Message file is not valid UTF-8")]
    NotUtf8,
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid config format: {0}")]
    InvalidFormat(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Errors raised by the external session host.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session command `{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

/// Bus-wide error type.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Timed out after {waited_ms}ms waiting for lock {}", path.display())]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Handler failed: {0}")]
    Handler(String),
}

impl BusError {
    /// Whether the caller may retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

impl From<notify::Error> for BusError {
    fn from(err: notify::Error) -> Self {
        Self::Watch(err.to_string())
    }
}

/// Result type alias defaulting to [`BusError`].
pub type Result<T, E = BusError> = std::result::Result<T, E>;
