// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory session host for tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::host::SessionHost;
use crate::error::SessionError;

/// One recorded injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Injection {
    File(PathBuf, bool),
    Text(String),
    Command(String),
}

#[derive(Debug, Default)]
struct FakeState {
    sessions: HashSet<String>,
    injections: HashMap<String, Vec<Injection>>,
    /// Captures that still return changing output.
    busy: HashMap<String, usize>,
    captures: HashMap<String, usize>,
}

/// Records injections; sessions exist only when added.
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<FakeState>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_session(&self, name: &str) {
        self.lock().sessions.insert(name.to_string());
    }

    pub fn remove_session(&self, name: &str) {
        self.lock().sessions.remove(name);
    }

    /// Make the next `captures` snapshots of a session differ from each other.
    pub fn set_busy_for(&self, name: &str, captures: usize) {
        self.lock().busy.insert(name.to_string(), captures);
    }

    pub fn injections(&self, name: &str) -> Vec<Injection> {
        self.lock().injections.get(name).cloned().unwrap_or_default()
    }

    /// Every injection across sessions, by session.
    pub fn all_injections(&self) -> HashMap<String, Vec<Injection>> {
        self.lock().injections.clone()
    }

    pub fn captures(&self, name: &str) -> usize {
        self.lock().captures.get(name).copied().unwrap_or(0)
    }

    fn record(&self, name: &str, injection: Injection) -> Result<(), SessionError> {
        let mut state = self.lock();
        if !state.sessions.contains(name) {
            return Err(SessionError::NotFound(name.to_string()));
        }
        state
            .injections
            .entry(name.to_string())
            .or_default()
            .push(injection);
        Ok(())
    }
}

#[async_trait]
impl SessionHost for FakeHost {
    async fn session_exists(&self, name: &str) -> bool {
        self.lock().sessions.contains(name)
    }

    async fn list_sessions(&self) -> Result<Vec<String>, SessionError> {
        let mut names: Vec<String> = self.lock().sessions.iter().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn create_session(&self, name: &str) -> Result<(), SessionError> {
        self.add_session(name);
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> Result<(), SessionError> {
        self.remove_session(name);
        Ok(())
    }

    async fn inject_file(&self, name: &str, path: &Path, is_prompt: bool) -> Result<(), SessionError> {
        self.record(name, Injection::File(path.to_path_buf(), is_prompt))
    }

    async fn inject_text(&self, name: &str, text: &str) -> Result<(), SessionError> {
        self.record(name, Injection::Text(text.to_string()))
    }

    async fn inject_command(&self, name: &str, command: &str) -> Result<(), SessionError> {
        self.record(name, Injection::Command(command.to_string()))
    }

    async fn capture_output(&self, name: &str) -> Result<String, SessionError> {
        let mut state = self.lock();
        if !state.sessions.contains(name) {
            return Err(SessionError::NotFound(name.to_string()));
        }
        *state.captures.entry(name.to_string()).or_insert(0) += 1;
        match state.busy.get_mut(name) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Ok(format!("working {}", remaining))
            }
            _ => Ok("> ".to_string()),
        }
    }
}
