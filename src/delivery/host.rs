// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The session host contract.
//!
//! Everything the bus needs from the environment that runs the agent
//! sessions: existence checks, lifecycle, injection and an observable
//! output snapshot for idle detection.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::idle::{self, IdleOutcome};
use crate::error::SessionError;

/// Why a session is or is not ready for input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessGate {
    /// The session does not exist.
    Missing,
    /// Output was still changing when the check timed out.
    Busy,
    Ready,
}

/// Result of [`SessionHost::readiness_check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub gate: ReadinessGate,
}

/// A host for named interactive sessions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionHost: Send + Sync {
    async fn session_exists(&self, name: &str) -> bool;

    async fn list_sessions(&self) -> Result<Vec<String>, SessionError>;

    async fn create_session(&self, name: &str) -> Result<(), SessionError>;

    async fn kill_session(&self, name: &str) -> Result<(), SessionError>;

    /// Inject a reference to a message file. `is_prompt` marks a full
    /// instruction prompt rather than an incoming message.
    async fn inject_file(&self, name: &str, path: &Path, is_prompt: bool) -> Result<(), SessionError>;

    /// Paste literal text and confirm it.
    async fn inject_text(&self, name: &str, text: &str) -> Result<(), SessionError>;

    /// Type a control command (such as a context reset) and confirm it.
    async fn inject_command(&self, name: &str, command: &str) -> Result<(), SessionError>;

    /// Snapshot of the session's visible output.
    async fn capture_output(&self, name: &str) -> Result<String, SessionError>;

    /// Poll the output until it stays unchanged for `idle_window`, giving up
    /// after `timeout`. Returns whether the session went idle.
    async fn wait_for_idle(
        &self,
        name: &str,
        poll: Duration,
        idle_window: Duration,
        timeout: Duration,
    ) -> bool {
        idle::wait_for_idle(self, name, poll, idle_window, timeout).await == IdleOutcome::Idle
    }

    /// Whether the session exists and is quiet, waiting at most `timeout`.
    async fn readiness_check(&self, name: &str, timeout: Duration) -> Readiness {
        if !self.session_exists(name).await {
            return Readiness {
                ready: false,
                gate: ReadinessGate::Missing,
            };
        }
        let window = (timeout / 2).min(Duration::from_secs(2));
        let poll = (window / 4).max(Duration::from_millis(1));
        match idle::wait_for_idle(self, name, poll, window, timeout).await {
            IdleOutcome::Idle => Readiness {
                ready: true,
                gate: ReadinessGate::Ready,
            },
            IdleOutcome::Missing => Readiness {
                ready: false,
                gate: ReadinessGate::Missing,
            },
            IdleOutcome::TimedOut => Readiness {
                ready: false,
                gate: ReadinessGate::Busy,
            },
        }
    }
}
