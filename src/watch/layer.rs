// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Turns file-creation events into dispatcher events.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::ignore::IgnoreSet;
use crate::events::{topics, ArrivedMessage, EventDispatcher, EventPayload};
use crate::message::{is_terminal_name, MessageFilename, EXTENSION};
use crate::paths::{BusPaths, PathLocation};
use crate::router::Resolver;

/// What the layer did with one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// Not a message file inside the layout.
    Unrelated,
    /// A `-done`/`-orphan`/`-failed` file.
    Terminal,
    /// Caused by the bus itself.
    Suppressed,
    /// A message file whose name could not be parsed.
    Unparseable,
    /// Published on the given topic.
    Published(String),
}

/// Classifies new files and publishes one event per genuine arrival.
pub struct WatchLayer {
    paths: BusPaths,
    dispatcher: Arc<EventDispatcher>,
    ignore: Arc<IgnoreSet>,
    resolver: Resolver,
}

impl WatchLayer {
    pub fn new(
        paths: BusPaths,
        dispatcher: Arc<EventDispatcher>,
        ignore: Arc<IgnoreSet>,
        resolver: Resolver,
    ) -> Self {
        Self {
            paths,
            dispatcher,
            ignore,
            resolver,
        }
    }

    /// Handle one created (or renamed-into-place) file.
    pub async fn handle_created(&self, path: &Path) -> WatchOutcome {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => return WatchOutcome::Unrelated,
        };
        if !name.ends_with(EXTENSION) || name.starts_with('.') {
            return WatchOutcome::Unrelated;
        }
        if is_terminal_name(name) {
            trace!(file = name, "Terminal file ignored");
            return WatchOutcome::Terminal;
        }
        let location = match self.paths.classify(path) {
            Some(location) => location,
            None => return WatchOutcome::Unrelated,
        };
        if self.ignore.consume(path) {
            trace!(file = name, "Own write suppressed");
            return WatchOutcome::Suppressed;
        }

        let parsed = match MessageFilename::parse(name) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(path = %path.display(), "Cannot address message: {}", e);
                return WatchOutcome::Unparseable;
            }
        };

        let sender_domain = match &location {
            PathLocation::Tier { owner, .. } => Some(owner.domain.clone()),
            PathLocation::Log { .. } => parsed.from_address().ok().and_then(|a| a.domain),
        };
        let hint = match parsed.to_address() {
            Ok(to) => self.resolver.hint(&to, sender_domain.as_deref()),
            Err(e) => {
                warn!(path = %path.display(), "Cannot address message: {}", e);
                return WatchOutcome::Unparseable;
            }
        };

        let topic = match &location {
            PathLocation::Tier { tier, .. } => topics::message(*tier),
            PathLocation::Log { .. } => topics::LOG.to_string(),
        };
        let arrived = ArrivedMessage {
            path: path.to_path_buf(),
            location,
            from: parsed.from,
            to: parsed.to,
            kind: parsed.kind,
            msg_id: parsed.msg_id,
            hint,
        };
        debug!(topic = %topic, file = name, "Message arrived");
        self.dispatcher
            .publish_async(&topic, EventPayload::MessageArrived(arrived))
            .await;
        WatchOutcome::Published(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BusEvent, SubscribeOptions};
    use crate::paths::{Tier, TierOwner};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    fn layer(temp: &TempDir) -> (WatchLayer, Arc<EventDispatcher>, Arc<IgnoreSet>) {
        let paths = BusPaths::new(temp.path());
        let dispatcher = Arc::new(EventDispatcher::new());
        let ignore = Arc::new(IgnoreSet::new(Duration::from_secs(5)));
        let resolver = Resolver::new(paths.clone(), "coordinator");
        (
            WatchLayer::new(paths, dispatcher.clone(), ignore.clone(), resolver),
            dispatcher,
            ignore,
        )
    }

    fn capture(dispatcher: &EventDispatcher) -> Arc<Mutex<Vec<BusEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        dispatcher.subscribe("message:*", SubscribeOptions::default(), move |event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });
        events
    }

    #[tokio::test]
    async fn test_publishes_tier_arrival_with_hint() {
        let temp = TempDir::new().unwrap();
        let (layer, dispatcher, _) = layer(&temp);
        let events = capture(&dispatcher);
        let path = temp
            .path()
            .join("domains/d/participants/a/msgs/outbox/0101120000-task-a>b-1234abcd.md");

        let outcome = layer.handle_created(&path).await;
        assert_eq!(outcome, WatchOutcome::Published("message:outbox".to_string()));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0].payload {
            EventPayload::MessageArrived(arrived) => {
                assert_eq!(arrived.hint.domain.as_deref(), Some("d"));
                assert_eq!(arrived.hint.participant, "b");
                assert_eq!(
                    arrived.tier(),
                    Some((&TierOwner::participant("d", "a"), Tier::Outbox))
                );
                assert_eq!(arrived.msg_id, "1234abcd");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_log_arrival_topic() {
        let temp = TempDir::new().unwrap();
        let (layer, _, _) = layer(&temp);
        let path = temp.path().join("log/0101120000-update-a>b-1234abcd.md");
        assert_eq!(
            layer.handle_created(&path).await,
            WatchOutcome::Published(topics::LOG.to_string())
        );
    }

    #[tokio::test]
    async fn test_suppresses_registered_path_once() {
        let temp = TempDir::new().unwrap();
        let (layer, dispatcher, ignore) = layer(&temp);
        let events = capture(&dispatcher);
        let path = temp
            .path()
            .join("domains/d/msgs/next/0101120000-task-a>b-1234abcd.md");
        ignore.register(&path);

        assert_eq!(layer.handle_created(&path).await, WatchOutcome::Suppressed);
        assert!(events.lock().unwrap().is_empty());
        assert!(matches!(
            layer.handle_created(&path).await,
            WatchOutcome::Published(_)
        ));
    }

    #[tokio::test]
    async fn test_filters() {
        let temp = TempDir::new().unwrap();
        let (layer, dispatcher, _) = layer(&temp);
        let events = capture(&dispatcher);
        let inbox = temp.path().join("domains/d/msgs/inbox");

        assert_eq!(
            layer
                .handle_created(&inbox.join("0101120000-task-a>b-1234abcd-done.md"))
                .await,
            WatchOutcome::Terminal
        );
        assert_eq!(
            layer
                .handle_created(&inbox.join(".0101120000-task-a>b-1234abcd.md.tmp"))
                .await,
            WatchOutcome::Unrelated
        );
        assert_eq!(
            layer.handle_created(&inbox.join("notes.md")).await,
            WatchOutcome::Unparseable
        );
        assert_eq!(
            layer
                .handle_created(&temp.path().join("domains/d/state.json"))
                .await,
            WatchOutcome::Unrelated
        );
        assert!(events.lock().unwrap().is_empty());
    }
}
