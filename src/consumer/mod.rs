// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Offset-tracked consumers of the shared message log.
//!
//! One consumer per participant. Its cursor is the `(timestamp, filename)`
//! of the last log message it delivered; anything addressed to it and past
//! the cursor is pending, as is anything held back because its session was
//! not running. Arrival events and the fallback poll both feed
//! [`OffsetConsumer::process_message`], which is safe to call twice for
//! the same file.

mod directive;
mod lens;
mod offset;

pub use directive::{render_template, Directive, CLEAR_CONTEXT, LENS, SELF_MODIFY};
pub use lens::{Lens, LensEntry, LensIndex};
pub use offset::{Cursor, OffsetRecord};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::bus::BusContext;
use crate::delivery::DeliverySerializer;
use crate::error::{BusError, Result};
use crate::evidence::{EvidenceContext, EvidenceKind};
use crate::message::{encode, read_message, Message, MessageFilename, MessageType};
use crate::paths::list_messages;

/// What `process_message` did with a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    Delivered(Directive),
    /// At or before the cursor, or already handled in this run.
    AlreadyProcessed,
    /// Not addressed to this consumer.
    NotAddressed,
    /// Header could not be decoded; recorded and skipped.
    Unparseable,
    /// Session not running; the file is held pending for the next attempt.
    SessionMissing,
}

pub struct OffsetConsumer {
    ctx: Arc<BusContext>,
    delivery: Arc<DeliverySerializer>,
    domain: String,
    participant: String,
    offset_path: PathBuf,
    record: Mutex<OffsetRecord>,
    /// Files claimed in this process, delivered or not.
    seen: Mutex<HashSet<String>>,
}

impl OffsetConsumer {
    pub fn new(
        ctx: Arc<BusContext>,
        delivery: Arc<DeliverySerializer>,
        domain: &str,
        participant: &str,
    ) -> Result<Self> {
        let id = format!("{}.{}", domain, participant);
        let offset_path = ctx.paths.offset_path(&id);
        let record = OffsetRecord::load(&offset_path, &id)?;
        Ok(Self {
            ctx,
            delivery,
            domain: domain.to_string(),
            participant: participant.to_string(),
            offset_path,
            record: Mutex::new(record),
            seen: Mutex::new(HashSet::new()),
        })
    }

    pub fn id(&self) -> String {
        format!("{}.{}", self.domain, self.participant)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub fn session(&self) -> String {
        self.ctx.config.session_name(&self.domain, &self.participant)
    }

    pub fn cursor(&self) -> Option<Cursor> {
        self.record().cursor()
    }

    fn record(&self) -> MutexGuard<'_, OffsetRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn seen(&self) -> MutexGuard<'_, HashSet<String>> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a log filename is addressed to this participant.
    pub fn is_addressed(&self, file: &str) -> bool {
        let Some(to) = MessageFilename::parse(file)
            .ok()
            .and_then(|f| f.to_address().ok())
        else {
            return false;
        };
        match &to.domain {
            Some(domain) => domain == &self.domain && to.name == self.participant,
            None => to.name == self.participant,
        }
    }

    fn position(&self, file: &str) -> Option<Cursor> {
        let parsed = MessageFilename::parse(file).ok()?;
        let timestamp = parsed.timestamp(Utc::now())?;
        Some(Cursor::new(timestamp, file))
    }

    fn is_done(&self, position: &Cursor) -> bool {
        self.record().is_done(position) || self.seen().contains(&position.file)
    }

    /// Pending log files addressed here, oldest first.
    pub fn pending(&self) -> Result<Vec<(Cursor, PathBuf)>> {
        let log = self.ctx.paths.log_dir();
        let mut pending: Vec<(Cursor, PathBuf)> = list_messages(&log)?
            .into_iter()
            .filter(|name| self.is_addressed(name))
            .filter_map(|name| {
                let position = self.position(&name)?;
                let path = log.join(&name);
                Some((position, path))
            })
            .filter(|(position, _)| !self.is_done(position))
            .collect();
        pending.sort();
        Ok(pending)
    }

    /// Process every pending message in order. Returns how many were
    /// delivered. A message that fails is logged and left for the next scan.
    pub async fn scan(&self) -> Result<usize> {
        let mut delivered = 0;
        for (_, path) in self.pending()? {
            match self.process_message(&path).await {
                Ok(Processed::Delivered(_)) => delivered += 1,
                Ok(_) => {}
                Err(e) => warn!(
                    consumer = %self.id(),
                    file = %path.display(),
                    "Message not processed: {}",
                    e
                ),
            }
        }
        Ok(delivered)
    }

    /// Fallback poll loop; never returns.
    pub async fn run_poll(self: Arc<Self>, every: Duration) {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            match self.scan().await {
                Ok(0) => {}
                Ok(n) => debug!(consumer = %self.id(), delivered = n, "Poll caught messages"),
                Err(e) => warn!(consumer = %self.id(), "Poll failed: {}", e),
            }
        }
    }

    /// Deliver one log message, applying its directive.
    ///
    /// The cursor is checked before any work and compared again before it
    /// is persisted, so an arrival event and a poll racing on the same
    /// file deliver it once.
    #[instrument(skip(self), fields(consumer = %self.id()))]
    pub async fn process_message(&self, path: &Path) -> Result<Processed> {
        let file = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        if !self.is_addressed(&file) {
            return Ok(Processed::NotAddressed);
        }
        let Some(position) = self.position(&file) else {
            return Ok(Processed::NotAddressed);
        };
        // Claim before the first await.
        {
            if self.record().is_done(&position) || !self.seen().insert(file.clone()) {
                return Ok(Processed::AlreadyProcessed);
            }
        }

        let message = match read_message(path) {
            Ok(message) => message,
            Err(BusError::Codec(e)) => {
                self.ctx.evidence.note(
                    EvidenceKind::ParseError,
                    format!("Cannot parse log message: {}", e),
                    self.evidence_context().file(file.clone()),
                );
                self.commit(&position)?;
                return Ok(Processed::Unparseable);
            }
            Err(e) => {
                self.seen().remove(&file);
                return Err(e);
            }
        };
        for issue in message.validate() {
            warn!(file = %file, "Message validation: {}", issue);
        }

        let session = self.session();
        if !self.delivery.host().session_exists(&session).await {
            let newly_held = self.hold(&position);
            self.seen().remove(&file);
            if newly_held? {
                self.ctx.evidence.note(
                    EvidenceKind::MissingDestination,
                    format!("Session `{}` not running; {} stays pending", session, file),
                    self.evidence_context().file(file.clone()),
                );
            }
            return Ok(Processed::SessionMissing);
        }

        let directive = Directive::from_message(&message);
        self.deliver(&session, path, &file, &message, &directive)?;
        self.commit(&position)?;
        info!(file = %file, directive = %directive, "Log message delivered");
        Ok(Processed::Delivered(directive))
    }

    fn deliver(
        &self,
        session: &str,
        path: &Path,
        file: &str,
        message: &Message,
        directive: &Directive,
    ) -> Result<()> {
        let is_prompt = message.kind == MessageType::Prompt;
        if directive.resets() {
            self.delivery
                .inject_command(session, self.ctx.config.reset_command.clone());
        }
        match directive {
            Directive::SelfModify(name) => {
                let template_path = self.ctx.paths.templates_dir().join(format!("{}.md", name));
                let body = match std::fs::read_to_string(&template_path) {
                    Ok(template) => render_template(&template, message),
                    Err(e) => {
                        warn!(template = %name, "Template unavailable, delivering body as is: {}", e);
                        message.body.clone()
                    }
                };
                let rendered = self.write_rendered(file, message, body)?;
                self.delivery.inject_file(session, rendered, true);
            }
            Directive::Lens(name) => {
                let index = LensIndex::load(&self.ctx.paths.lens_index_path())?;
                match index.get(name) {
                    Some(lens) => {
                        let rendered =
                            self.write_rendered(file, message, lens.apply(&message.body))?;
                        self.delivery.inject_file(session, rendered, is_prompt);
                    }
                    None => {
                        warn!(lens = %name, "Unknown lens, delivering unchanged");
                        self.delivery.inject_file(session, path.to_path_buf(), is_prompt);
                    }
                }
            }
            Directive::ClearContext | Directive::Plain => {
                self.delivery.inject_file(session, path.to_path_buf(), is_prompt);
            }
        }
        Ok(())
    }

    /// Write a rewritten copy under `rendered/`, outside the watched tiers.
    fn write_rendered(&self, file: &str, message: &Message, body: String) -> Result<PathBuf> {
        let dir = self.ctx.paths.rendered_dir();
        std::fs::create_dir_all(&dir)?;
        let mut rendered = message.clone();
        rendered.body = body;
        let path = dir.join(format!("{}-{}", self.participant, file));
        let tmp = dir.join(format!(".{}-{}.tmp", self.participant, file));
        std::fs::write(&tmp, encode(&rendered))?;
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Persist `position` as held. Returns whether it was newly held.
    fn hold(&self, position: &Cursor) -> Result<bool> {
        let mut record = self.record();
        if !record.hold(position) {
            return Ok(false);
        }
        record.save(&self.offset_path)?;
        Ok(true)
    }

    fn commit(&self, position: &Cursor) -> Result<()> {
        let mut record = self.record();
        if record.advance(position) {
            record.save(&self.offset_path)?;
        }
        Ok(())
    }

    fn evidence_context(&self) -> EvidenceContext {
        EvidenceContext::new()
            .domain(self.domain.clone())
            .participant(self.participant.clone())
    }
}
