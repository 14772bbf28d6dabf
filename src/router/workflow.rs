// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workflow handoff between a domain's participants.

use tracing::{debug, info, instrument};

use super::{Router, RouterJob};
use crate::config::DomainConfig;
use crate::error::{BusError, ConfigError, Result};
use crate::events::{topics, EventPayload};
use crate::message::{write_message, Address, Message, MessageFilename, MessageType};
use crate::paths::{Tier, TierOwner};
use crate::state::{StatePatch, WorkflowRecord, STATUS_IDLE};

/// Build the task handed from `from` to `to`, carrying the previous output.
pub fn handoff_message(
    domain: &str,
    from: &str,
    to: &str,
    output: Option<&str>,
    task: Option<&Message>,
) -> Message {
    let mut body = format!("## Handoff from {}\n\n", from);
    match output.map(str::trim).filter(|o| !o.is_empty()) {
        Some(output) => body.push_str(output),
        None => body.push_str("(no output recorded)"),
    }
    body.push('\n');
    if let Some(task) = task {
        body.push_str("\n## Previous task\n\n");
        body.push_str(task.body.trim_end());
        body.push('\n');
    }

    let mut message = Message::new(
        MessageType::Task,
        &Address::qualified(domain, from),
        &Address::qualified(domain, to),
        body,
    )
    .with_field("handoff", "true");
    if let Some(id) = task.and_then(|t| t.msg_id.as_deref()) {
        message = message.with_field("parent-msg-id", id);
    }
    message
}

impl Router {
    /// Start (or restart) a domain's workflow.
    ///
    /// Without an explicit list, the domain config's `workflow` order is
    /// used, falling back to its participants.
    #[instrument(skip(self))]
    pub async fn start_workflow(
        &self,
        domain: &str,
        participants: Option<Vec<String>>,
    ) -> Result<WorkflowRecord> {
        let _drain = self.drain.lock().await;
        if !self.ctx.paths.domain_exists(domain) {
            return Err(BusError::DomainNotFound(domain.to_string()));
        }
        let order = match participants.filter(|p| !p.is_empty()) {
            Some(list) => list,
            None => DomainConfig::load(&self.ctx.paths, domain)?
                .map(|c| c.workflow_order())
                .unwrap_or_default(),
        };
        if order.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "workflow".to_string(),
                message: format!("domain `{}` has no participants", domain),
            }
            .into());
        }

        let workflow = WorkflowRecord::new(order);
        let owner = TierOwner::domain(domain);
        self.ctx
            .state
            .update(
                &owner,
                StatePatch::new()
                    .workflow(&workflow)
                    .current_participant(workflow.current())
                    .previous_participant(None),
            )
            .await?;
        info!(domain, participants = ?workflow.participants, "Workflow started");
        Ok(workflow)
    }

    /// Record that a domain task is headed for `participant`.
    ///
    /// When no workflow is running, one is started from the domain config
    /// with its cursor on `participant`, so that completing the task hands
    /// off to whoever follows.
    pub(super) async fn assign_domain_task(&self, domain: &str, participant: &str) -> Result<()> {
        let owner = TierOwner::domain(domain);
        let state = self.ctx.state.read(&owner)?;
        let mut patch = StatePatch::new().current_participant(Some(participant));

        let running = state.workflow.as_ref().is_some_and(|w| !w.complete);
        if !running {
            let order = DomainConfig::load(&self.ctx.paths, domain)?
                .map(|c| c.workflow_order())
                .unwrap_or_default();
            if let Some(cursor) = order.iter().position(|p| p == participant) {
                let mut workflow = WorkflowRecord::new(order);
                workflow.cursor = cursor;
                patch = patch.workflow(&workflow);
                info!(domain, participant, "Workflow started by incoming task");
            }
        }
        self.ctx.state.update(&owner, patch).await?;
        Ok(())
    }

    /// Hand the domain's completed work to the next participant, or mark
    /// the workflow complete at the last one.
    ///
    /// Only a completion by the participant the cursor points at counts.
    pub(super) async fn advance_workflow(
        &self,
        domain: &str,
        participant: &str,
        file: &str,
        task: Option<&Message>,
        output: Option<&str>,
    ) -> Result<()> {
        let owner = TierOwner::domain(domain);
        let state = self.ctx.state.read(&owner)?;
        let Some(mut workflow) = state.workflow.filter(|w| !w.complete) else {
            return Ok(());
        };
        if workflow.current() != Some(participant) {
            debug!(domain, participant, "Completion is not the workflow's current step");
            return Ok(());
        }

        if workflow.is_last() {
            workflow.complete = true;
            self.ctx
                .state
                .update(
                    &owner,
                    StatePatch::new().workflow(&workflow).status(STATUS_IDLE),
                )
                .await?;
            info!(domain, file, "Workflow complete");
            self.ctx.dispatcher.publish(
                topics::WORKFLOW_COMPLETE,
                EventPayload::WorkflowComplete {
                    domain: domain.to_string(),
                },
            );
            return Ok(());
        }

        let (Some(from), Some(to)) = (
            workflow.current().map(str::to_string),
            workflow.next().map(str::to_string),
        ) else {
            return Ok(());
        };
        workflow.cursor += 1;

        let target = TierOwner::participant(domain, to.clone());
        self.ctx.paths.ensure_owner_dirs(&target)?;
        let inbox = self.ctx.paths.tier_dir(&target, Tier::Inbox);
        let message = handoff_message(domain, &from, &to, output, task);
        let name = MessageFilename::for_message(&message)?.to_string();
        let path = inbox.join(&name);
        self.ctx.ignore.register(&path);
        if let Err(e) = write_message(&inbox, &message) {
            self.ctx.ignore.forget(&path);
            return Err(e);
        }

        self.ctx
            .state
            .update(
                &owner,
                StatePatch::new()
                    .workflow(&workflow)
                    .current_participant(Some(&to))
                    .previous_participant(Some(&from)),
            )
            .await?;
        info!(domain, from = %from, to = %to, cursor = workflow.cursor, "Workflow advanced");
        self.ctx.dispatcher.publish(
            topics::WORKFLOW_ADVANCED,
            EventPayload::WorkflowAdvanced {
                domain: domain.to_string(),
                from,
                to,
                cursor: workflow.cursor,
            },
        );
        self.push(RouterJob::Inbox(target));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handoff_message_carries_output() {
        let task = Message::new(
            MessageType::Task,
            &Address::bare("lead"),
            &Address::bare("a"),
            "Write the parser",
        );
        let msg = handoff_message("d", "a", "b", Some("parser done, see src/"), Some(&task));
        assert_eq!(msg.from, "d/a");
        assert_eq!(msg.to, "d/b");
        assert_eq!(msg.kind, MessageType::Task);
        assert!(msg.body.contains("parser done, see src/"));
        assert!(msg.body.contains("Write the parser"));
        assert!(msg.flag("handoff"));
        assert_eq!(msg.field("parent-msg-id"), task.msg_id.as_deref());
    }

    #[test]
    fn test_handoff_without_output() {
        let msg = handoff_message("d", "a", "b", None, None);
        assert!(msg.body.contains("(no output recorded)"));
    }
}
