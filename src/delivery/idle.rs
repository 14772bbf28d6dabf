// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Idle detection by snapshot diffing.
//!
//! Sessions expose no "done" hook, so quiescence is inferred: sample the
//! output every `poll`, and call the session idle once the snapshot has not
//! changed for `idle_window`. Expiry of `timeout` is not an error.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::trace;

use super::host::SessionHost;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    Idle,
    TimedOut,
    /// The output could not be captured (the session went away).
    Missing,
}

pub async fn wait_for_idle<H>(
    host: &H,
    name: &str,
    poll: Duration,
    idle_window: Duration,
    timeout: Duration,
) -> IdleOutcome
where
    H: SessionHost + ?Sized,
{
    let started = Instant::now();
    let mut last = match host.capture_output(name).await {
        Ok(snapshot) => snapshot,
        Err(_) => return IdleOutcome::Missing,
    };
    let mut stable_since = Instant::now();

    loop {
        if stable_since.elapsed() >= idle_window {
            trace!(session = name, "Session idle");
            return IdleOutcome::Idle;
        }
        if started.elapsed() >= timeout {
            trace!(session = name, "Idle wait timed out");
            return IdleOutcome::TimedOut;
        }
        sleep(poll).await;
        match host.capture_output(name).await {
            Ok(snapshot) if snapshot == last => {}
            Ok(snapshot) => {
                last = snapshot;
                stable_since = Instant::now();
            }
            Err(_) => return IdleOutcome::Missing,
        }
    }
}
