// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

use super::*;
use crate::bus::fixture::{message_at, Fixture};
use crate::delivery::testing::Injection;
use crate::events::RoutingHint;
use crate::message::{write_message, Message};

fn put(fx: &Fixture, owner: &TierOwner, tier: Tier, message: &Message) -> String {
    let dir = fx.ctx().paths.tier_dir(owner, tier);
    std::fs::create_dir_all(&dir).unwrap();
    let path = write_message(&dir, message).unwrap();
    file_name(&path)
}

fn tier(fx: &Fixture, owner: &TierOwner, tier: Tier) -> Vec<String> {
    fx.ctx().paths.list_tier(owner, tier).unwrap()
}

fn all_files(fx: &Fixture, owner: &TierOwner, tier: Tier) -> Vec<String> {
    list_message_files(&fx.ctx().paths.tier_dir(owner, tier)).unwrap()
}

fn count(fx: &Fixture, kind: EvidenceKind) -> usize {
    fx.ctx().evidence.count(kind).unwrap()
}

#[tokio::test]
async fn test_fifo_and_single_active() {
    let fx = Fixture::new();
    fx.domain("d", &["a"], None);
    let session = fx.session("d", "a");
    let owner = TierOwner::participant("d", "a");
    let third = put(&fx, &owner, Tier::Inbox, &message_at(MessageType::Task, "lead", "a", "3", 30));
    let first = put(&fx, &owner, Tier::Inbox, &message_at(MessageType::Task, "lead", "a", "1", 10));
    let second = put(&fx, &owner, Tier::Inbox, &message_at(MessageType::Task, "lead", "a", "2", 20));

    fx.router().process_inbox(&owner).await.unwrap();
    assert_eq!(tier(&fx, &owner, Tier::Active), vec![first.clone()]);
    assert_eq!(tier(&fx, &owner, Tier::Next), vec![second.clone()]);
    assert_eq!(tier(&fx, &owner, Tier::Inbox), vec![third.clone()]);

    // A second pass changes nothing while active is occupied.
    fx.router().process_next(&owner).await.unwrap();
    fx.router().process_inbox(&owner).await.unwrap();
    assert_eq!(tier(&fx, &owner, Tier::Active), vec![first.clone()]);

    fx.router().complete(&owner, &first).await.unwrap();
    assert_eq!(tier(&fx, &owner, Tier::Active), vec![second.clone()]);
    assert_eq!(tier(&fx, &owner, Tier::Next), vec![third.clone()]);
    assert!(tier(&fx, &owner, Tier::Inbox).is_empty());

    fx.router().complete(&owner, &second).await.unwrap();
    fx.router().complete(&owner, &third).await.unwrap();
    fx.settle().await;

    let active = fx.ctx().paths.tier_dir(&owner, Tier::Active);
    assert_eq!(
        fx.host.injections(&session),
        vec![
            Injection::File(active.join(&first), false),
            Injection::File(active.join(&second), false),
            Injection::File(active.join(&third), false),
        ]
    );
    let state = fx.ctx().state.read(&owner).unwrap();
    assert_eq!(state.completed_tasks, 3);
    assert_eq!(state.status, STATUS_IDLE);
}

#[tokio::test]
async fn test_process_next_noop_when_active_occupied() {
    let fx = Fixture::new();
    fx.domain("d", &["a"], None);
    let owner = TierOwner::participant("d", "a");
    let busy = put(&fx, &owner, Tier::Active, &message_at(MessageType::Task, "x", "a", "", 1));
    let waiting = put(&fx, &owner, Tier::Next, &message_at(MessageType::Task, "x", "a", "", 2));

    fx.router().process_next(&owner).await.unwrap();
    assert_eq!(tier(&fx, &owner, Tier::Active), vec![busy]);
    assert_eq!(tier(&fx, &owner, Tier::Next), vec![waiting]);
}

#[tokio::test]
async fn test_completion_is_idempotent() {
    let fx = Fixture::new();
    fx.domain("d", &["a"], None);
    fx.session("d", "a");
    let owner = TierOwner::participant("d", "a");
    let file = put(&fx, &owner, Tier::Inbox, &message_at(MessageType::Task, "x", "a", "", 1));
    fx.router().process_inbox(&owner).await.unwrap();

    let done = fx.router().complete(&owner, &file).await.unwrap();
    let Completion::Completed(path) = done else {
        panic!("first completion should move the file");
    };
    assert!(file_name(&path).ends_with("-done.md"));
    assert_eq!(
        fx.router().complete(&owner, &file).await.unwrap(),
        Completion::AlreadyComplete
    );
    assert_eq!(all_files(&fx, &owner, Tier::Complete).len(), 1);
}

#[tokio::test]
async fn test_simple_handoff() {
    let fx = Fixture::new();
    fx.domain("d", &["a", "b"], None);
    fx.session("d", "a");
    let b_session = fx.session("d", "b");
    let domain = TierOwner::domain("d");
    let file = put(
        &fx,
        &domain,
        Tier::Inbox,
        &message_at(MessageType::Task, "lead", "d/a", "Write the parser", 1),
    );

    fx.router().process_inbox(&domain).await.unwrap();
    fx.router().process_next(&domain).await.unwrap();
    assert_eq!(tier(&fx, &domain, Tier::Active), vec![file.clone()]);
    let state = fx.ctx().state.read(&domain).unwrap();
    assert_eq!(state.current_participant.as_deref(), Some("a"));
    assert_eq!(state.workflow.as_ref().map(|w| w.cursor), Some(0));

    fx.router()
        .complete_with_output(&domain, &file, Some("Parser lives in src/parse.rs"))
        .await
        .unwrap();

    let b = TierOwner::participant("d", "b");
    let handoffs: Vec<PathBuf> = [Tier::Inbox, Tier::Next, Tier::Active]
        .into_iter()
        .flat_map(|t| {
            let dir = fx.ctx().paths.tier_dir(&b, t);
            tier(&fx, &b, t).into_iter().map(move |f| dir.join(f))
        })
        .collect();
    assert_eq!(handoffs.len(), 1);
    let handoff = read_message(&handoffs[0]).unwrap();
    assert!(handoff.body.contains("Parser lives in src/parse.rs"));
    assert!(handoff.flag("handoff"));

    let state = fx.ctx().state.read(&domain).unwrap();
    let workflow = state.workflow.unwrap();
    assert_eq!(workflow.cursor, 1);
    assert!(!workflow.complete);
    assert_eq!(state.current_participant.as_deref(), Some("b"));
    assert_eq!(state.previous_participant.as_deref(), Some("a"));

    fx.settle().await;
    assert_eq!(fx.host.injections(&b_session).len(), 1);
}

#[tokio::test]
async fn test_task_complete_finishes_workflow() {
    let fx = Fixture::new();
    fx.domain("d", &["a", "b"], None);
    fx.session("d", "a");
    fx.session("d", "b");
    let domain = TierOwner::domain("d");
    let a = TierOwner::participant("d", "a");
    let b = TierOwner::participant("d", "b");
    put(
        &fx,
        &domain,
        Tier::Inbox,
        &message_at(MessageType::Task, "lead", "d/a", "step one", 1),
    );
    fx.router().process_inbox(&domain).await.unwrap();

    // a reports back through its outbox; the domain task completes.
    put(
        &fx,
        &a,
        Tier::Outbox,
        &message_at(MessageType::TaskComplete, "d/a", "lead", "step one done", 2),
    );
    fx.router().process_outbox(&a).await.unwrap();
    assert!(tier(&fx, &domain, Tier::Active).is_empty());
    assert_eq!(tier(&fx, &b, Tier::Active).len(), 1);

    // b reports back; the handoff completes and the workflow ends.
    put(
        &fx,
        &b,
        Tier::Outbox,
        &message_at(MessageType::TaskComplete, "d/b", "lead", "step two done", 3),
    );
    fx.router().process_outbox(&b).await.unwrap();
    assert!(tier(&fx, &b, Tier::Active).is_empty());
    let workflow = fx.ctx().state.read(&domain).unwrap().workflow.unwrap();
    assert!(workflow.complete);
    assert_eq!(workflow.cursor, 1);
    assert_eq!(fx.ctx().dispatcher.count(topics::WORKFLOW_COMPLETE), 1);
}

#[tokio::test]
async fn test_task_complete_completes_participant_active() {
    let fx = Fixture::new();
    fx.domain("d", &["a"], None);
    fx.session("d", "a");
    let a = TierOwner::participant("d", "a");
    let task = put(&fx, &a, Tier::Inbox, &message_at(MessageType::Task, "lead", "a", "go", 1));
    fx.router().process_inbox(&a).await.unwrap();
    assert_eq!(tier(&fx, &a, Tier::Active), vec![task]);

    put(
        &fx,
        &a,
        Tier::Outbox,
        &message_at(MessageType::TaskComplete, "a", "lead", "went", 2),
    );
    fx.router().process_outbox(&a).await.unwrap();
    assert!(tier(&fx, &a, Tier::Active).is_empty());
    assert_eq!(all_files(&fx, &a, Tier::Complete).len(), 1);
}

#[tokio::test]
async fn test_routes_bare_domain_to_entry_point() {
    let fx = Fixture::new();
    fx.domain("d1", &["x"], None);
    fx.domain("d2", &["p", "q"], Some("q"));
    let x = TierOwner::participant("d1", "x");
    let file = put(&fx, &x, Tier::Outbox, &message_at(MessageType::Task, "x", "d2", "hi", 1));

    fx.router().process_outbox(&x).await.unwrap();
    assert!(tier(&fx, &x, Tier::Outbox).is_empty());
    let q = TierOwner::participant("d2", "q");
    assert_eq!(tier(&fx, &q, Tier::Active), vec![file]);
    assert_eq!(count(&fx, EvidenceKind::HardcodedFallback), 0);
    // No session for d2/q: recorded, message stays active.
    assert_eq!(count(&fx, EvidenceKind::MissingDestination), 1);
}

#[tokio::test]
async fn test_domain_without_participants_uses_fallback() {
    let fx = Fixture::new();
    fx.domain("d1", &["x"], None);
    fx.ctx()
        .paths
        .ensure_owner_dirs(&TierOwner::domain("empty"))
        .unwrap();
    let x = TierOwner::participant("d1", "x");
    let file = put(&fx, &x, Tier::Outbox, &message_at(MessageType::Task, "x", "empty", "hi", 1));

    fx.router().process_outbox(&x).await.unwrap();
    assert_eq!(count(&fx, EvidenceKind::HardcodedFallback), 1);
    let fallback = TierOwner::participant("empty", "coordinator");
    assert_eq!(tier(&fx, &fallback, Tier::Active), vec![file]);
}

#[tokio::test]
async fn test_unroutable_message_left_unchanged() {
    let fx = Fixture::new();
    fx.domain("d", &["a"], None);
    let a = TierOwner::participant("d", "a");
    let file = put(
        &fx,
        &a,
        Tier::Outbox,
        &message_at(MessageType::Task, "a", "nonexistent-domain/x", "lost?", 1),
    );
    let path = fx.ctx().paths.tier_dir(&a, Tier::Outbox).join(&file);
    let before = std::fs::read(&path).unwrap();

    fx.router().process_outbox(&a).await.unwrap();
    fx.router().process_outbox(&a).await.unwrap();
    fx.router().recover().await.unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), before);
    assert_eq!(count(&fx, EvidenceKind::DomainNotFound), 1);
    let record = fx
        .ctx()
        .evidence
        .tail(1, Some(EvidenceKind::DomainNotFound), None)
        .unwrap()
        .remove(0);
    assert_eq!(record.context.domain.as_deref(), Some("nonexistent-domain"));
    assert_eq!(record.context.participant.as_deref(), Some("x"));
    assert_eq!(record.context.file.as_deref(), Some(file.as_str()));
    assert!(record.context.header.is_some());
}

#[tokio::test]
async fn test_unparseable_outbox_file_recorded_once() {
    let fx = Fixture::new();
    fx.domain("d", &["a"], None);
    let a = TierOwner::participant("d", "a");
    let outbox = fx.ctx().paths.tier_dir(&a, Tier::Outbox);
    let bad = outbox.join("0101000001-task-a>b-deadbeef.md");
    std::fs::write(&bad, "just text").unwrap();

    fx.router().process_outbox(&a).await.unwrap();
    fx.router().process_outbox(&a).await.unwrap();
    assert!(bad.exists());
    assert_eq!(count(&fx, EvidenceKind::ParseError), 1);
}

#[tokio::test]
async fn test_non_utf8_outbox_file_does_not_block_later_files() {
    let fx = Fixture::new();
    fx.domain("d", &["a", "b"], None);
    let a = TierOwner::participant("d", "a");
    let b = TierOwner::participant("d", "b");
    let outbox = fx.ctx().paths.tier_dir(&a, Tier::Outbox);
    let bad = outbox.join("0101000001-task-a>b-deadbeef.md");
    std::fs::write(&bad, [0xff, 0xfe, 0x00, 0x80]).unwrap();
    let good = put(&fx, &a, Tier::Outbox, &message_at(MessageType::Task, "d/a", "d/b", "go", 5));

    fx.router().process_outbox(&a).await.unwrap();
    fx.router().process_outbox(&a).await.unwrap();

    assert_eq!(all_files(&fx, &a, Tier::Outbox), vec![file_name(&bad)]);
    let delivered: Vec<String> = [Tier::Inbox, Tier::Next, Tier::Active]
        .into_iter()
        .flat_map(|t| tier(&fx, &b, t))
        .collect();
    assert_eq!(delivered, vec![good]);
    assert_eq!(count(&fx, EvidenceKind::ParseError), 1);
}

#[tokio::test]
async fn test_ask_fast_tracks_past_busy_domain() {
    let fx = Fixture::new();
    fx.domain("d", &["a"], None);
    fx.session("d", "a");
    let domain = TierOwner::domain("d");
    let blocker = put(&fx, &domain, Tier::Next, &message_at(MessageType::Task, "l", "d/a", "", 1));
    put(&fx, &domain, Tier::Active, &message_at(MessageType::Task, "l", "d/a", "", 0));
    let ask = put(&fx, &domain, Tier::Inbox, &message_at(MessageType::Ask, "l", "d/a", "?", 2));

    fx.router().process_inbox(&domain).await.unwrap();
    assert!(tier(&fx, &domain, Tier::Inbox).is_empty());
    assert_eq!(tier(&fx, &domain, Tier::Next), vec![blocker]);
    let a = TierOwner::participant("d", "a");
    assert_eq!(tier(&fx, &a, Tier::Active), vec![ask]);
}

#[tokio::test]
async fn test_missing_session_leaves_message_active() {
    let fx = Fixture::new();
    fx.domain("d", &["a"], None);
    let a = TierOwner::participant("d", "a");
    let file = put(&fx, &a, Tier::Inbox, &message_at(MessageType::Task, "l", "a", "", 1));

    fx.router().process_inbox(&a).await.unwrap();
    assert_eq!(tier(&fx, &a, Tier::Active), vec![file.clone()]);
    let record = fx
        .ctx()
        .evidence
        .tail(1, Some(EvidenceKind::MissingDestination), Some("d"))
        .unwrap()
        .remove(0);
    assert_eq!(record.context.file.as_deref(), Some(file.as_str()));
    assert_eq!(
        fx.ctx().state.read(&a).unwrap().status,
        crate::state::STATUS_PROCESSING
    );
}

#[tokio::test]
async fn test_fail_and_archive() {
    let fx = Fixture::new();
    fx.domain("d", &["a"], None);
    let a = TierOwner::participant("d", "a");
    let stuck = put(&fx, &a, Tier::Active, &message_at(MessageType::Task, "l", "a", "", 1));
    let waiting = put(&fx, &a, Tier::Next, &message_at(MessageType::Task, "l", "a", "", 2));

    let failed = fx.router().fail(&a, &stuck, "session wedged").await.unwrap();
    let Completion::Completed(path) = failed else {
        panic!("stuck file should move");
    };
    assert!(file_name(&path).ends_with("-failed.md"));
    assert_eq!(count(&fx, EvidenceKind::DeliveryFailure), 1);
    assert_eq!(tier(&fx, &a, Tier::Active), vec![waiting]);

    assert_eq!(fx.router().archive_completed(&a).await.unwrap(), 1);
    assert!(all_files(&fx, &a, Tier::Complete).is_empty());
    assert_eq!(all_files(&fx, &a, Tier::Archive).len(), 1);
}

#[tokio::test]
async fn test_replay_latest_prompt() {
    let fx = Fixture::new();
    fx.domain("d", &["a"], None);
    let a = TierOwner::participant("d", "a");
    let complete = fx.ctx().paths.tier_dir(&a, Tier::Complete);
    let old = put(&fx, &a, Tier::Complete, &message_at(MessageType::Prompt, "l", "a", "old", 1));
    let new = put(&fx, &a, Tier::Complete, &message_at(MessageType::Prompt, "l", "a", "new", 2));
    put(&fx, &a, Tier::Complete, &message_at(MessageType::Task, "l", "a", "later", 3));
    let new_done = terminal_name(&new, TerminalState::Done);
    std::fs::rename(complete.join(&new), complete.join(&new_done)).unwrap();
    assert_ne!(old, new);

    // No session yet.
    assert!(fx.router().replay_latest_prompt(&a).await.is_err());
    assert_eq!(count(&fx, EvidenceKind::MissingDestination), 1);

    let session = fx.session("d", "a");
    let replayed = fx.router().replay_latest_prompt(&a).await.unwrap();
    assert_eq!(replayed, Some(complete.join(&new_done)));
    fx.settle().await;
    assert_eq!(
        fx.host.injections(&session),
        vec![
            Injection::Command("/clear".to_string()),
            Injection::File(complete.join(&new_done), true),
        ]
    );
}

#[tokio::test]
async fn test_scan_stuck_reports_once() {
    let fx = Fixture::new();
    fx.domain("d", &["a"], None);
    let a = TierOwner::participant("d", "a");
    put(&fx, &a, Tier::Active, &message_at(MessageType::Task, "l", "a", "", 1));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(fx.router().scan_stuck(Duration::from_secs(3600)).unwrap(), 0);
    assert_eq!(fx.router().scan_stuck(Duration::from_millis(1)).unwrap(), 1);
    assert_eq!(fx.router().scan_stuck(Duration::from_millis(1)).unwrap(), 0);
    assert_eq!(count(&fx, EvidenceKind::StuckMessage), 1);
}

#[tokio::test]
async fn test_duplicate_notifications_suppressed() {
    let fx = Fixture::new();
    let owner = TierOwner::domain("d");
    assert!(!fx.router().is_duplicate(&owner, "f.md"));
    assert!(fx.router().is_duplicate(&owner, "f.md"));
    assert!(!fx.router().is_duplicate(&owner, "g.md"));
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!fx.router().is_duplicate(&owner, "f.md"));
}

#[tokio::test]
async fn test_handle_arrival_processes_tier() {
    let fx = Fixture::new();
    fx.domain("d", &["a"], None);
    let a = TierOwner::participant("d", "a");
    let message = message_at(MessageType::Task, "l", "a", "", 1);
    let file = put(&fx, &a, Tier::Inbox, &message);
    let arrived = ArrivedMessage {
        path: fx.ctx().paths.tier_dir(&a, Tier::Inbox).join(&file),
        location: PathLocation::Tier {
            owner: a.clone(),
            tier: Tier::Inbox,
            file: file.clone(),
        },
        from: "l".to_string(),
        to: "a".to_string(),
        kind: MessageType::Task,
        msg_id: message.msg_id.clone().unwrap(),
        hint: RoutingHint {
            domain: Some("d".to_string()),
            participant: "a".to_string(),
        },
    };

    fx.router().handle_arrival(&arrived).await.unwrap();
    assert_eq!(tier(&fx, &a, Tier::Active), vec![file]);
}

#[tokio::test]
async fn test_recover_routes_leftovers() {
    let fx = Fixture::new();
    fx.domain("d", &["a", "b"], None);
    let a = TierOwner::participant("d", "a");
    let b = TierOwner::participant("d", "b");
    let file = put(&fx, &a, Tier::Outbox, &message_at(MessageType::Update, "a", "b", "", 1));

    fx.router().recover().await.unwrap();
    assert!(tier(&fx, &a, Tier::Outbox).is_empty());
    assert_eq!(tier(&fx, &b, Tier::Active), vec![file]);
}

#[tokio::test]
async fn test_start_workflow_validation() {
    let fx = Fixture::new();
    fx.domain("d", &["a", "b"], None);
    assert!(matches!(
        fx.router().start_workflow("nope", None).await,
        Err(BusError::DomainNotFound(_))
    ));
    let workflow = fx
        .router()
        .start_workflow("d", Some(vec!["b".to_string(), "a".to_string()]))
        .await
        .unwrap();
    assert_eq!(workflow.current(), Some("b"));

    fx.ctx()
        .paths
        .ensure_owner_dirs(&TierOwner::domain("bare"))
        .unwrap();
    assert!(matches!(
        fx.router().start_workflow("bare", None).await,
        Err(BusError::Config(_))
    ));
}
