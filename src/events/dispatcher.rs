// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process publish/subscribe.
//!
//! Topics are plain strings. A subscription topic containing `*` is a
//! wildcard, translated to an anchored regex when an event is dispatched.
//! Matching handlers run in descending priority; ties keep subscription
//! order. [`EventDispatcher::publish_async`] awaits handlers one at a time,
//! never concurrently, since handlers move files between queue tiers.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use regex::Regex;
use tracing::{debug, error, warn};

use super::types::{BusEvent, EventPayload};
use crate::error::{BusError, Result};

/// Default size of the diagnostic event buffer.
pub const DEFAULT_HISTORY: usize = 1000;

/// Boxed future returned by async handlers.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

type SyncHandler = Arc<dyn Fn(&BusEvent) -> Result<()> + Send + Sync>;
type AsyncHandler = Arc<dyn Fn(BusEvent) -> BoxFuture<Result<()>> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

#[derive(Clone)]
struct Listener {
    id: u64,
    priority: i32,
    once: bool,
    handler: Handler,
}

/// Options for a subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Higher runs first.
    pub priority: i32,
    /// Remove the subscription after its first invocation.
    pub once: bool,
}

impl SubscribeOptions {
    pub fn priority(priority: i32) -> Self {
        Self {
            priority,
            once: false,
        }
    }

    pub fn once() -> Self {
        Self {
            priority: 0,
            once: true,
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct DispatcherState {
    listeners: HashMap<String, Vec<Listener>>,
    next_id: u64,
    history: VecDeque<BusEvent>,
    counts: HashMap<String, u64>,
}

/// The event dispatcher. One instance per bus; never a process global.
pub struct EventDispatcher {
    state: Mutex<DispatcherState>,
    history_limit: usize,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    pub fn with_history(history_limit: usize) -> Self {
        Self {
            state: Mutex::new(DispatcherState {
                listeners: HashMap::new(),
                next_id: 0,
                history: VecDeque::new(),
                counts: HashMap::new(),
            }),
            history_limit: history_limit.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatcherState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe a synchronous handler.
    pub fn subscribe<F>(&self, topic: &str, options: SubscribeOptions, handler: F) -> SubscriptionId
    where
        F: Fn(&BusEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.insert(topic, options, Handler::Sync(Arc::new(handler)))
    }

    /// Subscribe an asynchronous handler.
    pub fn subscribe_async<F, Fut>(
        &self,
        topic: &str,
        options: SubscribeOptions,
        handler: F,
    ) -> SubscriptionId
    where
        F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: AsyncHandler =
            Arc::new(move |event| -> BoxFuture<Result<()>> { Box::pin(handler(event)) });
        self.insert(topic, options, Handler::Async(handler))
    }

    fn insert(&self, topic: &str, options: SubscribeOptions, handler: Handler) -> SubscriptionId {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        let listeners = state.listeners.entry(topic.to_string()).or_default();
        let position = listeners
            .iter()
            .position(|l| l.priority < options.priority)
            .unwrap_or(listeners.len());
        listeners.insert(
            position,
            Listener {
                id,
                priority: options.priority,
                once: options.once,
                handler,
            },
        );
        SubscriptionId(id)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let mut removed = false;
        for listeners in state.listeners.values_mut() {
            let before = listeners.len();
            listeners.retain(|l| l.id != id.0);
            removed |= listeners.len() != before;
        }
        state.listeners.retain(|_, l| !l.is_empty());
        removed
    }

    /// Number of subscriptions registered under exactly this topic.
    pub fn listener_count(&self, topic: &str) -> usize {
        self.lock().listeners.get(topic).map_or(0, Vec::len)
    }

    /// Remove every subscription and clear diagnostics.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.listeners.clear();
        state.history.clear();
        state.counts.clear();
    }

    /// Record the event and take the matching handlers, in invocation order.
    fn prepare(&self, event: &BusEvent) -> Vec<Handler> {
        let mut state = self.lock();

        if state.history.len() >= self.history_limit {
            state.history.pop_front();
        }
        state.history.push_back(event.clone());
        *state.counts.entry(event.topic.clone()).or_insert(0) += 1;

        let mut matched: Vec<(i32, u64, Handler)> = Vec::new();
        let mut fired_once: Vec<u64> = Vec::new();
        for (topic, listeners) in &state.listeners {
            let matches = if topic == &event.topic {
                true
            } else if topic.contains('*') {
                wildcard_matches(topic, &event.topic)
            } else {
                false
            };
            if !matches {
                continue;
            }
            for listener in listeners {
                matched.push((listener.priority, listener.id, listener.handler.clone()));
                if listener.once {
                    fired_once.push(listener.id);
                }
            }
        }

        if !fired_once.is_empty() {
            for listeners in state.listeners.values_mut() {
                listeners.retain(|l| !fired_once.contains(&l.id));
            }
            state.listeners.retain(|_, l| !l.is_empty());
        }

        matched.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        matched.into_iter().map(|(_, _, h)| h).collect()
    }

    /// Publish on the calling thread.
    ///
    /// Sync handlers run inline. Async handlers cannot be awaited here; they
    /// are handed, still in order, to one spawned task when a Tokio runtime
    /// is available. Returns the number of handlers invoked or scheduled.
    pub fn publish(&self, topic: &str, payload: EventPayload) -> usize {
        let event = BusEvent::new(topic, payload);
        let handlers = self.prepare(&event);
        let count = handlers.len();

        let mut deferred = Vec::new();
        for handler in handlers {
            match handler {
                Handler::Sync(f) => run_sync(&f, &event),
                Handler::Async(f) => deferred.push(f),
            }
        }

        if !deferred.is_empty() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        for f in deferred {
                            run_async(&f, event.clone()).await;
                        }
                    });
                }
                Err(_) => warn!(
                    topic,
                    "No async runtime; skipped {} async handler(s)",
                    deferred.len()
                ),
            }
        }
        count
    }

    /// Publish and await every matching handler sequentially, in priority order.
    pub async fn publish_async(&self, topic: &str, payload: EventPayload) -> usize {
        let event = BusEvent::new(topic, payload);
        let handlers = self.prepare(&event);
        let count = handlers.len();
        for handler in handlers {
            match handler {
                Handler::Sync(f) => run_sync(&f, &event),
                Handler::Async(f) => run_async(&f, event.clone()).await,
            }
        }
        count
    }

    /// The most recent events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<BusEvent> {
        let state = self.lock();
        let skip = state.history.len().saturating_sub(n);
        state.history.iter().skip(skip).cloned().collect()
    }

    /// How many events were published on a topic.
    pub fn count(&self, topic: &str) -> u64 {
        self.lock().counts.get(topic).copied().unwrap_or(0)
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn run_sync(handler: &SyncHandler, event: &BusEvent) {
    match catch_unwind(AssertUnwindSafe(|| handler(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(topic = %event.topic, "Event handler failed: {}", e),
        Err(_) => error!(topic = %event.topic, "Event handler panicked"),
    }
}

async fn run_async(handler: &AsyncHandler, event: BusEvent) {
    let topic = event.topic.clone();
    // Spawned and awaited immediately: keeps ordering, contains panics.
    match tokio::spawn(handler(event)).await {
        Ok(Ok(())) => debug!(topic = %topic, "Async handler finished"),
        Ok(Err(e)) => error!(topic = %topic, "Event handler failed: {}", e),
        Err(e) => error!(topic = %topic, "Event handler panicked: {}", e),
    }
}

/// Match a `*` wildcard pattern against a topic.
pub fn wildcard_matches(pattern: &str, topic: &str) -> bool {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    match Regex::new(&format!("^{}$", body)) {
        Ok(re) => re.is_match(topic),
        Err(e) => {
            warn!(pattern, "Invalid wildcard topic: {}", e);
            false
        }
    }
}

/// Wrap an error message as a handler failure.
pub fn handler_error(message: impl Into<String>) -> BusError {
    BusError::Handler(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn custom() -> EventPayload {
        EventPayload::Custom(serde_json::json!({}))
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&BusEvent) -> Result<()> + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        let make = move |name: &str| {
            let log = Arc::clone(&log_clone);
            let name = name.to_string();
            Box::new(move |_: &BusEvent| {
                log.lock().unwrap().push(name.clone());
                Ok(())
            }) as Box<dyn Fn(&BusEvent) -> Result<()> + Send + Sync>
        };
        (log, make)
    }

    #[test]
    fn test_priority_order_and_ties() {
        let dispatcher = EventDispatcher::new();
        let (log, make) = recorder();
        dispatcher.subscribe("t", SubscribeOptions::priority(0), make("low-1"));
        dispatcher.subscribe("t", SubscribeOptions::priority(10), make("high"));
        dispatcher.subscribe("t", SubscribeOptions::priority(0), make("low-2"));
        dispatcher.subscribe("t", SubscribeOptions::priority(5), make("mid"));

        assert_eq!(dispatcher.publish("t", custom()), 4);
        assert_eq!(*log.lock().unwrap(), vec!["high", "mid", "low-1", "low-2"]);
    }

    #[test]
    fn test_wildcard_and_direct_merge_by_priority() {
        let dispatcher = EventDispatcher::new();
        let (log, make) = recorder();
        dispatcher.subscribe("message:inbox", SubscribeOptions::default(), make("direct"));
        dispatcher.subscribe("message:*", SubscribeOptions::priority(1), make("wild"));
        dispatcher.subscribe("state:*", SubscribeOptions::priority(9), make("other"));

        dispatcher.publish("message:inbox", custom());
        assert_eq!(*log.lock().unwrap(), vec!["wild", "direct"]);
    }

    #[test]
    fn test_wildcard_matching_is_anchored() {
        assert!(wildcard_matches("message:*", "message:inbox"));
        assert!(wildcard_matches("*:log", "message:log"));
        assert!(!wildcard_matches("message:*", "xmessage:inbox"));
        assert!(wildcard_matches("a.b*", "a.bc"));
        assert!(!wildcard_matches("a.b*", "axbc"));
    }

    #[test]
    fn test_once_fires_once() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        dispatcher.subscribe("t", SubscribeOptions::once(), move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        dispatcher.publish("t", custom());
        dispatcher.publish("t", custom());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.listener_count("t"), 0);
    }

    #[test]
    fn test_failing_handler_does_not_stop_others() {
        let dispatcher = EventDispatcher::new();
        let (log, make) = recorder();
        dispatcher.subscribe("t", SubscribeOptions::priority(2), |_| {
            Err(handler_error("boom"))
        });
        dispatcher.subscribe("t", SubscribeOptions::priority(1), |_| panic!("kaboom"));
        dispatcher.subscribe("t", SubscribeOptions::default(), make("survivor"));
        dispatcher.publish("t", custom());
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
    }

    #[test]
    fn test_unsubscribe() {
        let dispatcher = EventDispatcher::new();
        let id = dispatcher.subscribe("t", SubscribeOptions::default(), |_| Ok(()));
        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        assert_eq!(dispatcher.publish("t", custom()), 0);
    }

    #[test]
    fn test_history_is_bounded_and_counted() {
        let dispatcher = EventDispatcher::with_history(3);
        for _ in 0..5 {
            dispatcher.publish("a", custom());
        }
        dispatcher.publish("b", custom());
        assert_eq!(dispatcher.recent(10).len(), 3);
        assert_eq!(dispatcher.recent(1)[0].topic, "b");
        assert_eq!(dispatcher.count("a"), 5);
        assert_eq!(dispatcher.count("b"), 1);
        assert_eq!(dispatcher.count("c"), 0);
    }

    #[tokio::test]
    async fn test_publish_async_is_sequential() {
        let dispatcher = EventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l1 = Arc::clone(&log);
        dispatcher.subscribe_async("t", SubscribeOptions::priority(1), move |_| {
            let log = Arc::clone(&l1);
            async move {
                log.lock().unwrap().push("first:start");
                tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                log.lock().unwrap().push("first:end");
                Ok(())
            }
        });
        let l2 = Arc::clone(&log);
        dispatcher.subscribe_async("t", SubscribeOptions::default(), move |_| {
            let log = Arc::clone(&l2);
            async move {
                log.lock().unwrap().push("second");
                Ok(())
            }
        });

        assert_eq!(dispatcher.publish_async("t", custom()).await, 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:start", "first:end", "second"]
        );
    }

    #[tokio::test]
    async fn test_sync_publish_schedules_async_handlers() {
        let dispatcher = EventDispatcher::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        dispatcher.subscribe_async("t", SubscribeOptions::default(), move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.topic);
                Ok(())
            }
        });
        assert_eq!(dispatcher.publish("t", custom()), 1);
        let got = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some("t"));
    }
}
