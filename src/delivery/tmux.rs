// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! tmux-backed session host.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, instrument};

use super::host::SessionHost;
use crate::error::SessionError;

/// Runs sessions as detached tmux sessions.
#[derive(Debug, Clone)]
pub struct TmuxHost {
    binary: String,
    /// Pause between pasting and pressing Enter.
    settle_delay: Duration,
}

impl TmuxHost {
    pub fn new(binary: impl Into<String>, settle_delay: Duration) -> Self {
        Self {
            binary: binary.into(),
            settle_delay,
        }
    }

    /// Run a tmux command, returning trimmed stdout.
    async fn tmux(&self, args: &[&str]) -> Result<String, SessionError> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
        } else {
            Err(SessionError::CommandFailed {
                command: args.first().copied().unwrap_or_default().to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn press_enter(&self, name: &str) -> Result<(), SessionError> {
        self.tmux(&["send-keys", "-t", name, "Enter"]).await.map(|_| ())
    }
}

/// The text injected for a message file.
pub fn file_reference(path: &Path, is_prompt: bool) -> String {
    if is_prompt {
        format!("Read and follow the instructions in @{}", path.display())
    } else {
        format!("New message: @{}", path.display())
    }
}

#[async_trait]
impl SessionHost for TmuxHost {
    async fn session_exists(&self, name: &str) -> bool {
        let target = format!("={}", name);
        self.tmux(&["has-session", "-t", &target]).await.is_ok()
    }

    async fn list_sessions(&self) -> Result<Vec<String>, SessionError> {
        match self.tmux(&["list-sessions", "-F", "#{session_name}"]).await {
            Ok(out) => Ok(out.lines().map(str::to_string).collect()),
            // No server means no sessions.
            Err(SessionError::CommandFailed { message, .. })
                if message.contains("no server running") || message.contains("No such file") =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn create_session(&self, name: &str) -> Result<(), SessionError> {
        if self.session_exists(name).await {
            return Ok(());
        }
        self.tmux(&["new-session", "-d", "-s", name]).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn kill_session(&self, name: &str) -> Result<(), SessionError> {
        let target = format!("={}", name);
        self.tmux(&["kill-session", "-t", &target]).await.map(|_| ())
    }

    async fn inject_file(&self, name: &str, path: &Path, is_prompt: bool) -> Result<(), SessionError> {
        self.inject_text(name, &file_reference(path, is_prompt)).await
    }

    #[instrument(skip(self, text), fields(len = text.len()))]
    async fn inject_text(&self, name: &str, text: &str) -> Result<(), SessionError> {
        let buffer = format!("meshbus-{}", name);
        self.tmux(&["set-buffer", "-b", &buffer, "--", text]).await?;
        self.tmux(&["paste-buffer", "-d", "-b", &buffer, "-t", name])
            .await?;
        sleep(self.settle_delay).await;
        self.press_enter(name).await?;
        debug!(session = name, "Text injected");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn inject_command(&self, name: &str, command: &str) -> Result<(), SessionError> {
        self.tmux(&["send-keys", "-t", name, "-l", command]).await?;
        sleep(self.settle_delay).await;
        self.press_enter(name).await
    }

    async fn capture_output(&self, name: &str) -> Result<String, SessionError> {
        self.tmux(&["capture-pane", "-p", "-t", name])
            .await
            .map_err(|e| match e {
                SessionError::CommandFailed { .. } => SessionError::NotFound(name.to_string()),
                other => other,
            })
    }
}
