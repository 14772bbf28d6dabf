// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-session delivery queues.
//!
//! Enqueueing never blocks. Each session has one FIFO drained by at most one
//! task: inject the head item, wait for the session to go quiet, then take
//! the next. A missing session halts its queue until the next enqueue.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use super::host::SessionHost;
use crate::config::DeliveryTimings;
use crate::error::SessionError;

/// One pending injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryItem {
    File { path: PathBuf, is_prompt: bool },
    Text(String),
    Command(String),
}

#[derive(Debug, Clone)]
struct Pending {
    seq: u64,
    item: DeliveryItem,
}

#[derive(Debug, Default)]
struct SessionQueue {
    items: VecDeque<Pending>,
    /// A drain task is running.
    busy: bool,
    /// The last drain stopped because the session was missing.
    halted: bool,
}

/// Snapshot of one session queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub pending: usize,
    pub busy: bool,
    pub halted: bool,
}

/// Serializes injections per session.
pub struct DeliverySerializer {
    host: Arc<dyn SessionHost>,
    timings: DeliveryTimings,
    queues: Mutex<HashMap<String, SessionQueue>>,
    next_seq: AtomicU64,
    settled: Notify,
}

impl DeliverySerializer {
    pub fn new(host: Arc<dyn SessionHost>, timings: DeliveryTimings) -> Arc<Self> {
        Arc::new(Self {
            host,
            timings,
            queues: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            settled: Notify::new(),
        })
    }

    pub fn host(&self) -> &Arc<dyn SessionHost> {
        &self.host
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionQueue>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue an injection; returns its sequence number.
    pub fn enqueue(self: &Arc<Self>, session: &str, item: DeliveryItem) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let start = {
            let mut queues = self.lock();
            let queue = queues.entry(session.to_string()).or_default();
            queue.items.push_back(Pending { seq, item });
            if queue.busy {
                false
            } else {
                queue.busy = true;
                queue.halted = false;
                true
            }
        };
        debug!(session, seq, "Delivery queued");

        if start {
            let this = Arc::clone(self);
            let session = session.to_string();
            tokio::spawn(async move { this.drain(session).await });
        }
        seq
    }

    pub fn inject_file(self: &Arc<Self>, session: &str, path: impl Into<PathBuf>, is_prompt: bool) -> u64 {
        self.enqueue(
            session,
            DeliveryItem::File {
                path: path.into(),
                is_prompt,
            },
        )
    }

    pub fn inject_text(self: &Arc<Self>, session: &str, text: impl Into<String>) -> u64 {
        self.enqueue(session, DeliveryItem::Text(text.into()))
    }

    pub fn inject_command(self: &Arc<Self>, session: &str, command: impl Into<String>) -> u64 {
        self.enqueue(session, DeliveryItem::Command(command.into()))
    }

    #[instrument(skip(self))]
    async fn drain(self: Arc<Self>, session: String) {
        loop {
            let head = {
                let queues = self.lock();
                queues
                    .get(&session)
                    .and_then(|q| q.items.front().cloned())
            };
            let Some(pending) = head else {
                self.finish(&session, false);
                return;
            };

            if !self.host.session_exists(&session).await {
                warn!(
                    session = %session,
                    seq = pending.seq,
                    "Session missing; delivery halted until next enqueue"
                );
                self.finish(&session, true);
                return;
            }

            {
                let mut queues = self.lock();
                if let Some(queue) = queues.get_mut(&session) {
                    queue.items.pop_front();
                }
            }

            if let Err(e) = self.inject(&session, &pending.item).await {
                warn!(session = %session, seq = pending.seq, "Injection failed: {}", e);
                continue;
            }
            info!(session = %session, seq = pending.seq, "Delivered");

            let idle = self
                .host
                .wait_for_idle(
                    &session,
                    self.timings.poll_interval(),
                    self.timings.idle_window(),
                    self.timings.idle_timeout(),
                )
                .await;
            if !idle {
                debug!(session = %session, "Session not idle before timeout; continuing");
            }
        }
    }

    async fn inject(&self, session: &str, item: &DeliveryItem) -> Result<(), SessionError> {
        match item {
            DeliveryItem::File { path, is_prompt } => {
                self.host.inject_file(session, path, *is_prompt).await
            }
            DeliveryItem::Text(text) => self.host.inject_text(session, text).await,
            DeliveryItem::Command(command) => self.host.inject_command(session, command).await,
        }
    }

    fn finish(&self, session: &str, halted: bool) {
        {
            let mut queues = self.lock();
            if let Some(queue) = queues.get_mut(session) {
                queue.busy = false;
                queue.halted = halted;
            }
        }
        self.settled.notify_waiters();
    }

    pub fn status(&self, session: &str) -> QueueStatus {
        let queues = self.lock();
        match queues.get(session) {
            Some(q) => QueueStatus {
                pending: q.items.len(),
                busy: q.busy,
                halted: q.halted,
            },
            None => QueueStatus {
                pending: 0,
                busy: false,
                halted: false,
            },
        }
    }

    /// Whether no session queue has a running drain.
    pub fn is_settled(&self) -> bool {
        self.lock().values().all(|q| !q.busy)
    }

    /// Wait until every drain task has stopped (queue empty or halted).
    /// Returns false on timeout.
    pub async fn wait_settled(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.settled.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_settled() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}
