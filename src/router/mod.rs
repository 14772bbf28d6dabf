// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Queue tier state machine.
//!
//! ```text
//!            outbox ──route──▶ inbox ──▶ next ──▶ active ──▶ complete ──▶ archive
//!   (sender's tiers)      (destination's tiers)      │
//!                                                    └─▶ session injection
//! ```
//!
//! Every owner (a domain, or a participant in it) has its own tiers. At
//! most one message sits in `active` and at most one in `next`; everything
//! else waits in `inbox` in filename order. `ask` messages in a domain inbox
//! skip straight to the addressed participant's inbox.
//!
//! Transitions are queued as [`RouterJob`]s and drained by a loop, so a
//! long backlog never deepens the call stack. Only one drain runs at a
//! time.

mod resolve;
mod workflow;

pub use resolve::{Resolution, RouteSource, Resolver};

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, info, instrument, warn};

use crate::bus::BusContext;
use crate::delivery::DeliverySerializer;
use crate::error::{BusError, Result, SessionError};
use crate::events::{topics, ArrivedMessage, EventPayload};
use crate::evidence::{EvidenceContext, EvidenceKind};
use crate::message::{
    read_message, terminal_name, MessageFilename, MessageType, TerminalState, EXTENSION,
};
use crate::paths::{list_messages, PathLocation, Tier, TierOwner};
use crate::state::{StatePatch, STATUS_IDLE, STATUS_PROCESSING};

/// One pending transition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouterJob {
    Inbox(TierOwner),
    Next(TierOwner),
    Outbox(TierOwner),
}

impl fmt::Display for RouterJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbox(owner) => write!(f, "inbox({})", owner),
            Self::Next(owner) => write!(f, "next({})", owner),
            Self::Outbox(owner) => write!(f, "outbox({})", owner),
        }
    }
}

/// Result of a completion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Moved to `complete` under its `-done` name.
    Completed(PathBuf),
    /// Nothing in `active` under that name.
    AlreadyComplete,
}

/// Moves messages between tiers and hands them to sessions.
pub struct Router {
    ctx: Arc<BusContext>,
    delivery: Arc<DeliverySerializer>,
    jobs: Mutex<VecDeque<RouterJob>>,
    drain: tokio::sync::Mutex<()>,
    /// Last notification per (owner, file), for duplicate suppression.
    recent: Mutex<HashMap<(TierOwner, String), Instant>>,
    /// Files already reported, so a stuck file is not re-reported every pass.
    reported: Mutex<HashSet<(EvidenceKind, PathBuf)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Router {
    pub fn new(ctx: Arc<BusContext>, delivery: Arc<DeliverySerializer>) -> Self {
        Self {
            ctx,
            delivery,
            jobs: Mutex::new(VecDeque::new()),
            drain: tokio::sync::Mutex::new(()),
            recent: Mutex::new(HashMap::new()),
            reported: Mutex::new(HashSet::new()),
        }
    }

    // ========================================================================
    // Public entry points
    // ========================================================================

    /// Move the first inbox message into `next` if it is free.
    pub async fn process_inbox(&self, owner: &TierOwner) -> Result<()> {
        self.run(vec![RouterJob::Inbox(owner.clone())]).await
    }

    /// Activate the first `next` message if `active` is free.
    pub async fn process_next(&self, owner: &TierOwner) -> Result<()> {
        self.run(vec![RouterJob::Next(owner.clone())]).await
    }

    /// Route every outbox message of `owner` to its destination inbox.
    pub async fn process_outbox(&self, owner: &TierOwner) -> Result<()> {
        self.run(vec![RouterJob::Outbox(owner.clone())]).await
    }

    /// Complete an active message. Completing twice is a no-op.
    pub async fn complete(&self, owner: &TierOwner, file: &str) -> Result<Completion> {
        self.complete_with_output(owner, file, None).await
    }

    /// Complete an active message, passing `output` on to the next
    /// workflow participant.
    #[instrument(skip(self, output), fields(owner = %owner))]
    pub async fn complete_with_output(
        &self,
        owner: &TierOwner,
        file: &str,
        output: Option<&str>,
    ) -> Result<Completion> {
        let _drain = self.drain.lock().await;
        let completion = self.complete_step(owner, file, output).await?;
        self.drain_jobs().await?;
        Ok(completion)
    }

    /// Move a stuck active message to `complete` under its `-failed` name.
    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn fail(&self, owner: &TierOwner, file: &str, reason: &str) -> Result<Completion> {
        let _drain = self.drain.lock().await;
        let active = self.ctx.paths.tier_dir(owner, Tier::Active).join(file);
        if !active.exists() {
            return Ok(Completion::AlreadyComplete);
        }
        let target = self.move_terminal(owner, &active, Tier::Complete, TerminalState::Failed)?;
        self.ctx.evidence.note(
            EvidenceKind::DeliveryFailure,
            format!("Marked {} failed: {}", file, reason),
            self.context_for(owner).file(file),
        );
        self.ctx
            .state
            .update(owner, StatePatch::new().status(STATUS_IDLE))
            .await?;
        self.push(RouterJob::Next(owner.clone()));
        self.drain_jobs().await?;
        Ok(Completion::Completed(target))
    }

    /// Move everything in `complete` to `archive`. Returns how many moved.
    pub async fn archive_completed(&self, owner: &TierOwner) -> Result<usize> {
        let _drain = self.drain.lock().await;
        let complete = self.ctx.paths.tier_dir(owner, Tier::Complete);
        let archive = self.ctx.paths.tier_dir(owner, Tier::Archive);
        std::fs::create_dir_all(&archive)?;
        let mut moved = 0;
        for name in list_message_files(&complete)? {
            let target = archive.join(terminal_name(&name, TerminalState::Done));
            self.ctx.ignore.register(&target);
            std::fs::rename(complete.join(&name), &target)?;
            moved += 1;
        }
        info!(owner = %owner, moved, "Archived completed messages");
        Ok(moved)
    }

    /// Route everything left on disk: outboxes, then inboxes, then `next`.
    pub async fn recover(&self) -> Result<()> {
        let owners = self.ctx.paths.list_owners()?;
        let mut jobs = Vec::with_capacity(owners.len() * 3);
        jobs.extend(owners.iter().cloned().map(RouterJob::Outbox));
        jobs.extend(owners.iter().cloned().map(RouterJob::Inbox));
        jobs.extend(owners.into_iter().map(RouterJob::Next));
        self.run(jobs).await
    }

    /// React to a watch-layer arrival.
    pub async fn handle_arrival(&self, arrived: &ArrivedMessage) -> Result<()> {
        let (owner, tier) = match &arrived.location {
            PathLocation::Tier { owner, tier, .. } => (owner.clone(), *tier),
            PathLocation::Log { .. } => return Ok(()),
        };
        let job = match tier {
            Tier::Inbox => RouterJob::Inbox(owner.clone()),
            Tier::Next => RouterJob::Next(owner.clone()),
            Tier::Outbox => RouterJob::Outbox(owner.clone()),
            Tier::Active | Tier::Complete | Tier::Archive => return Ok(()),
        };
        if self.is_duplicate(&owner, arrived.file_name()) {
            debug!(owner = %owner, file = arrived.file_name(), "Duplicate notification dropped");
            return Ok(());
        }
        self.run(vec![job]).await
    }

    /// Record one stuck-message evidence entry per active file older than
    /// `threshold`. Returns how many new files were reported.
    pub fn scan_stuck(&self, threshold: Duration) -> Result<usize> {
        let mut reported = 0;
        for owner in self.ctx.paths.list_owners()? {
            let dir = self.ctx.paths.tier_dir(&owner, Tier::Active);
            for name in list_messages(&dir)? {
                let path = dir.join(&name);
                let age = std::fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| SystemTime::now().duration_since(modified).ok());
                if !age.is_some_and(|age| age > threshold) {
                    continue;
                }
                if !self.report_once(EvidenceKind::StuckMessage, &path) {
                    continue;
                }
                self.ctx.evidence.note(
                    EvidenceKind::StuckMessage,
                    format!(
                        "{} has been active for over {}s",
                        name,
                        threshold.as_secs()
                    ),
                    self.context_for(&owner).file(name.clone()),
                );
                reported += 1;
            }
        }
        Ok(reported)
    }

    /// Reset a participant's session and re-inject its most recent prompt.
    ///
    /// The stuck active message is left where it is.
    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn replay_latest_prompt(&self, owner: &TierOwner) -> Result<Option<PathBuf>> {
        let participant = match &owner.participant {
            Some(p) => p.clone(),
            None => match self.ctx.state.read(owner)?.current_participant {
                Some(p) => p,
                None => return Ok(None),
            },
        };
        let session = self.ctx.config.session_name(&owner.domain, &participant);
        if !self.delivery.host().session_exists(&session).await {
            self.ctx.evidence.note(
                EvidenceKind::MissingDestination,
                format!("Cannot replay into missing session {}", session),
                self.context_for(owner).participant(participant),
            );
            return Err(SessionError::NotFound(session).into());
        }

        let mut prompts = Vec::new();
        for tier in [Tier::Complete, Tier::Archive] {
            let dir = self.ctx.paths.tier_dir(owner, tier);
            for name in list_message_files(&dir)? {
                let is_prompt = MessageFilename::parse(&name)
                    .map(|f| f.kind == MessageType::Prompt)
                    .unwrap_or(false);
                if is_prompt {
                    prompts.push((name.clone(), dir.join(name)));
                }
            }
        }
        prompts.sort();
        let Some((_, latest)) = prompts.pop() else {
            info!(session = %session, "No prompt to replay");
            return Ok(None);
        };

        self.delivery
            .inject_command(&session, self.ctx.config.reset_command.clone());
        self.delivery.inject_file(&session, latest.clone(), true);
        info!(session = %session, prompt = %latest.display(), "Replaying prompt");
        Ok(Some(latest))
    }

    // ========================================================================
    // Work queue
    // ========================================================================

    fn push(&self, job: RouterJob) {
        let mut jobs = lock(&self.jobs);
        if !jobs.contains(&job) {
            jobs.push_back(job);
        }
    }

    fn pop(&self) -> Option<RouterJob> {
        lock(&self.jobs).pop_front()
    }

    async fn run(&self, jobs: Vec<RouterJob>) -> Result<()> {
        let _drain = self.drain.lock().await;
        for job in jobs {
            self.push(job);
        }
        self.drain_jobs().await
    }

    /// Drain the queue. Keeps going past failures; returns the first one.
    async fn drain_jobs(&self) -> Result<()> {
        let mut first_error = None;
        while let Some(job) = self.pop() {
            debug!(job = %job, "Router step");
            let result = match &job {
                RouterJob::Inbox(owner) => self.inbox_step(owner).await,
                RouterJob::Next(owner) => self.next_step(owner).await,
                RouterJob::Outbox(owner) => self.outbox_step(owner).await,
            };
            if let Err(e) = result {
                warn!(job = %job, "Router step failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn is_duplicate(&self, owner: &TierOwner, file: &str) -> bool {
        let window = self.ctx.config.dedup_window();
        let now = Instant::now();
        let mut recent = lock(&self.recent);
        recent.retain(|_, seen| now.duration_since(*seen) < window);
        let key = (owner.clone(), file.to_string());
        if recent.contains_key(&key) {
            return true;
        }
        recent.insert(key, now);
        false
    }

    fn report_once(&self, kind: EvidenceKind, path: &Path) -> bool {
        lock(&self.reported).insert((kind, path.to_path_buf()))
    }

    // ========================================================================
    // Steps (called only while the drain lock is held)
    // ========================================================================

    async fn inbox_step(&self, owner: &TierOwner) -> Result<()> {
        let paths = &self.ctx.paths;
        let inbox = paths.tier_dir(owner, Tier::Inbox);
        let files = list_messages(&inbox)?;
        if files.is_empty() {
            return Ok(());
        }
        let mut next_free = list_messages(&paths.tier_dir(owner, Tier::Next))?.is_empty();

        for name in files {
            let is_ask = MessageFilename::parse(&name)
                .map(|f| f.kind == MessageType::Ask)
                .unwrap_or(false);

            if owner.is_domain() && is_ask {
                self.fast_track_ask(owner, &inbox.join(&name)).await?;
                continue;
            }
            if !next_free {
                continue;
            }

            let source = inbox.join(&name);
            if owner.is_domain() {
                if let Some(participant) = self.addressed_participant(owner, &source)? {
                    self.assign_domain_task(&owner.domain, &participant).await?;
                }
            }
            self.move_to(&source, &paths.tier_dir(owner, Tier::Next))?;
            debug!(owner = %owner, file = %name, "inbox -> next");
            next_free = false;
            self.push(RouterJob::Next(owner.clone()));
        }
        Ok(())
    }

    async fn fast_track_ask(&self, owner: &TierOwner, source: &Path) -> Result<()> {
        let Some(participant) = self.addressed_participant(owner, source)? else {
            warn!(owner = %owner, file = %source.display(), "Ask has no addressable participant");
            return Ok(());
        };
        let target_owner = TierOwner::participant(owner.domain.clone(), participant);
        self.ctx.paths.ensure_owner_dirs(&target_owner)?;
        self.move_to(source, &self.ctx.paths.tier_dir(&target_owner, Tier::Inbox))?;
        debug!(owner = %owner, to = %target_owner, "ask fast-tracked");
        self.push(RouterJob::Inbox(target_owner));
        Ok(())
    }

    async fn next_step(&self, owner: &TierOwner) -> Result<()> {
        let paths = &self.ctx.paths;
        if !list_messages(&paths.tier_dir(owner, Tier::Active))?.is_empty() {
            return Ok(());
        }
        let next_dir = paths.tier_dir(owner, Tier::Next);
        let Some(name) = list_messages(&next_dir)?.into_iter().next() else {
            return Ok(());
        };

        let active = self.move_to(&next_dir.join(&name), &paths.tier_dir(owner, Tier::Active))?;
        info!(owner = %owner, file = %name, "Message activated");
        self.ctx
            .state
            .update(owner, StatePatch::new().status(STATUS_PROCESSING))
            .await?;
        self.push(RouterJob::Inbox(owner.clone()));
        self.notify_session(owner, &active).await
    }

    async fn outbox_step(&self, owner: &TierOwner) -> Result<()> {
        let outbox = self.ctx.paths.tier_dir(owner, Tier::Outbox);
        for name in list_messages(&outbox)? {
            if let Err(e) = self.route_one(owner, &outbox.join(&name)).await {
                warn!(owner = %owner, file = %name, "Outgoing message not routed: {}", e);
            }
        }
        Ok(())
    }

    /// Route one outbox file. Unroutable files stay where they are.
    async fn route_one(&self, owner: &TierOwner, source: &Path) -> Result<()> {
        let name = file_name(source);
        let message = match read_message(source) {
            Ok(message) => message,
            Err(BusError::Codec(e)) => {
                if self.report_once(EvidenceKind::ParseError, source) {
                    self.ctx.evidence.note(
                        EvidenceKind::ParseError,
                        format!("Cannot parse outgoing message: {}", e),
                        self.context_for(owner).file(name.clone()),
                    );
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        for issue in message.validate() {
            warn!(file = %name, "Message validation: {}", issue);
        }

        let to = match message.to_address() {
            Ok(to) => to,
            Err(e) => {
                if self.report_once(EvidenceKind::RoutingFailure, source) {
                    self.ctx.evidence.note(
                        EvidenceKind::RoutingFailure,
                        format!("Unroutable destination: {}", e),
                        self.context_for(owner)
                            .file(name.clone())
                            .header(message.header_fields()),
                    );
                }
                return Ok(());
            }
        };

        let resolution = match self.ctx.resolver.resolve(&to, Some(&owner.domain)) {
            Ok(resolution) => resolution,
            Err(BusError::DomainNotFound(domain)) => {
                if self.report_once(EvidenceKind::DomainNotFound, source) {
                    self.ctx.evidence.note(
                        EvidenceKind::DomainNotFound,
                        format!("Domain `{}` for `{}` does not exist", domain, message.to),
                        EvidenceContext::new()
                            .domain(domain)
                            .participant(to.name.clone())
                            .file(name.clone())
                            .header(message.header_fields()),
                    );
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if resolution.source == RouteSource::Fallback {
            self.ctx.evidence.note(
                EvidenceKind::HardcodedFallback,
                format!(
                    "Domain `{}` has no entry point or participants; using `{}`",
                    resolution.domain, resolution.participant
                ),
                EvidenceContext::new()
                    .domain(resolution.domain.clone())
                    .participant(resolution.participant.clone())
                    .file(name.clone())
                    .header(message.header_fields()),
            );
        }

        let target_owner = resolution.owner();
        self.ctx.paths.ensure_owner_dirs(&target_owner)?;
        self.move_to(source, &self.ctx.paths.tier_dir(&target_owner, Tier::Inbox))?;
        info!(
            from = %owner,
            to = %target_owner,
            via = %resolution.source,
            file = %name,
            "Message routed"
        );
        self.push(RouterJob::Inbox(target_owner));

        if message.kind == MessageType::TaskComplete && !owner.is_domain() {
            self.auto_complete(owner, &message.body).await?;
        }
        Ok(())
    }

    /// A participant reported completion: complete its own active message
    /// and the domain's active message addressed to it.
    async fn auto_complete(&self, owner: &TierOwner, output: &str) -> Result<()> {
        let paths = &self.ctx.paths;
        if let Some(name) = list_messages(&paths.tier_dir(owner, Tier::Active))?
            .into_iter()
            .next()
        {
            self.complete_step(owner, &name, Some(output)).await?;
        }

        let domain = TierOwner::domain(owner.domain.clone());
        let domain_active = paths.tier_dir(&domain, Tier::Active);
        if let Some(name) = list_messages(&domain_active)?.into_iter().next() {
            let addressed = self.addressed_participant(&domain, &domain_active.join(&name))?;
            if addressed.as_deref() == owner.participant.as_deref() {
                self.complete_step(&domain, &name, Some(output)).await?;
            }
        }
        Ok(())
    }

    async fn complete_step(
        &self,
        owner: &TierOwner,
        file: &str,
        output: Option<&str>,
    ) -> Result<Completion> {
        let active = self.ctx.paths.tier_dir(owner, Tier::Active).join(file);
        if !active.exists() {
            debug!(owner = %owner, file, "Already complete");
            return Ok(Completion::AlreadyComplete);
        }
        let task = read_message(&active).ok();
        let participant = self.addressed_participant(owner, &active)?;
        let target = self.move_terminal(owner, &active, Tier::Complete, TerminalState::Done)?;

        let completed = self.ctx.state.read(owner)?.completed_tasks;
        self.ctx
            .state
            .update(
                owner,
                StatePatch::new()
                    .status(STATUS_IDLE)
                    .set("completedTasks", completed + 1),
            )
            .await?;
        info!(owner = %owner, file, "Message completed");
        self.ctx.dispatcher.publish(
            topics::TASK_COMPLETED,
            EventPayload::TaskCompleted {
                owner: owner.clone(),
                file: file.to_string(),
            },
        );

        // Domain tasks and handed-off participant tasks move the workflow on.
        let advances = owner.is_domain() || task.as_ref().is_some_and(|t| t.flag("handoff"));
        if let (true, Some(participant)) = (advances, participant) {
            self.advance_workflow(&owner.domain, &participant, file, task.as_ref(), output)
                .await?;
        }
        self.push(RouterJob::Next(owner.clone()));
        Ok(Completion::Completed(target))
    }

    async fn notify_session(&self, owner: &TierOwner, active: &Path) -> Result<()> {
        let participant = match &owner.participant {
            Some(p) => Some(p.clone()),
            None => self.addressed_participant(owner, active)?,
        };
        let Some(participant) = participant else {
            warn!(owner = %owner, "No participant to deliver to");
            return Ok(());
        };
        let session = self.ctx.config.session_name(&owner.domain, &participant);
        if !self.delivery.host().session_exists(&session).await {
            self.ctx.evidence.note(
                EvidenceKind::MissingDestination,
                format!("Session `{}` not running; message left in active", session),
                self.context_for(owner)
                    .participant(participant)
                    .file(file_name(active)),
            );
            return Ok(());
        }
        let is_prompt = MessageFilename::parse(&file_name(active))
            .map(|f| f.kind == MessageType::Prompt)
            .unwrap_or(false);
        self.delivery.inject_file(&session, active.to_path_buf(), is_prompt);
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// The participant a domain-tier message is for: the header `to`, else
    /// the domain's current participant.
    fn addressed_participant(&self, owner: &TierOwner, path: &Path) -> Result<Option<String>> {
        if let Some(p) = &owner.participant {
            return Ok(Some(p.clone()));
        }
        let to = read_message(path)
            .ok()
            .and_then(|m| m.to_address().ok())
            .or_else(|| {
                MessageFilename::parse(&file_name(path))
                    .ok()
                    .and_then(|f| f.to_address().ok())
            });
        if let Some(to) = to {
            if to.domain.is_some() {
                return Ok(Some(to.name));
            }
            if to.name == owner.domain {
                return Ok(Some(self.ctx.resolver.default_participant(&owner.domain).0));
            }
            return Ok(Some(to.name));
        }
        Ok(self.ctx.state.read(owner)?.current_participant)
    }

    /// Rename `source` into `dir`, registering the destination first so the
    /// watch layer does not treat the move as a new message.
    fn move_to(&self, source: &Path, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let target = dir.join(file_name(source));
        self.ctx.ignore.register(&target);
        if let Err(e) = std::fs::rename(source, &target) {
            self.ctx.ignore.forget(&target);
            return Err(e.into());
        }
        Ok(target)
    }

    fn move_terminal(
        &self,
        owner: &TierOwner,
        source: &Path,
        tier: Tier,
        state: TerminalState,
    ) -> Result<PathBuf> {
        let dir = self.ctx.paths.tier_dir(owner, tier);
        std::fs::create_dir_all(&dir)?;
        let target = dir.join(terminal_name(&file_name(source), state));
        std::fs::rename(source, &target)?;
        Ok(target)
    }

    fn context_for(&self, owner: &TierOwner) -> EvidenceContext {
        let ctx = EvidenceContext::new().domain(owner.domain.clone());
        match &owner.participant {
            Some(p) => ctx.participant(p.clone()),
            None => ctx,
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

/// Every message file in a directory, terminal names included, sorted.
fn list_message_files(dir: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|n| n.ends_with(EXTENSION) && !n.starts_with('.'))
        .collect();
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests;
