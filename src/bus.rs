// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bus context and lifecycle.
//!
//! Everything that would otherwise be a process-wide registry (the listener
//! map, the ignore set, the delivery queues) lives on one [`BusContext`] or
//! on the [`Bus`] that owns it, so several buses can run side by side in
//! one test binary.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{BusConfig, DomainConfig};
use crate::consumer::OffsetConsumer;
use crate::delivery::{DeliverySerializer, SessionHost};
use crate::error::Result;
use crate::events::{topics, EventDispatcher, EventPayload, SubscribeOptions, SubscriptionId};
use crate::evidence::EvidenceRecorder;
use crate::paths::BusPaths;
use crate::router::{Resolver, Router};
use crate::state::StateStore;
use crate::watch::{FsWatcher, IgnoreSet, WatchLayer};

/// Shared, explicitly constructed bus components.
pub struct BusContext {
    pub config: BusConfig,
    pub paths: BusPaths,
    pub dispatcher: Arc<EventDispatcher>,
    pub ignore: Arc<IgnoreSet>,
    pub evidence: Arc<EvidenceRecorder>,
    pub state: StateStore,
    pub resolver: Resolver,
}

impl BusContext {
    /// Create the base directories and open the evidence log.
    ///
    /// Either failing is fatal: the bus cannot run without them.
    pub fn new(config: BusConfig) -> Result<Self> {
        let paths = config.paths();
        paths.ensure_base_dirs()?;
        let evidence = EvidenceRecorder::open(paths.evidence_path(), config.evidence_max_lines)?;
        let dispatcher = Arc::new(EventDispatcher::with_history(config.event_history));
        let state = StateStore::new(
            paths.clone(),
            Arc::clone(&dispatcher),
            config.lock_timeout(),
            config.stale_lock_age(),
        );
        Ok(Self {
            ignore: Arc::new(IgnoreSet::new(config.ignore_ttl())),
            evidence: Arc::new(evidence),
            resolver: Resolver::new(paths.clone(), config.fallback_participant.clone()),
            dispatcher,
            state,
            paths,
            config,
        })
    }

    /// Every `(domain, participant)` pair known from domain configs or
    /// participant directories.
    pub fn known_participants(&self) -> Result<Vec<(String, String)>> {
        let mut found = BTreeSet::new();
        for domain in self.paths.list_domains()? {
            match DomainConfig::load(&self.paths, &domain) {
                Ok(Some(config)) => {
                    for participant in config.participants {
                        found.insert((domain.clone(), participant));
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(domain = %domain, "Ignoring unreadable domain config: {}", e),
            }
        }
        for owner in self.paths.list_owners()? {
            if let Some(participant) = owner.participant {
                found.insert((owner.domain, participant));
            }
        }
        Ok(found.into_iter().collect())
    }
}

/// A bus instance: router, consumers, delivery and the watch layer.
///
/// `new` builds the components without starting anything, which is what
/// tests and one-shot CLI commands want; `start` adds the watcher, the
/// consumers and the periodic tasks.
pub struct Bus {
    ctx: Arc<BusContext>,
    delivery: Arc<DeliverySerializer>,
    router: Arc<Router>,
    consumers: Vec<Arc<OffsetConsumer>>,
    watcher: Option<FsWatcher>,
    tasks: Vec<JoinHandle<()>>,
    subscriptions: Vec<SubscriptionId>,
}

impl Bus {
    pub fn new(config: BusConfig, host: Arc<dyn SessionHost>) -> Result<Self> {
        let delivery = DeliverySerializer::new(host, config.delivery);
        let ctx = Arc::new(BusContext::new(config)?);
        let router = Arc::new(Router::new(Arc::clone(&ctx), Arc::clone(&delivery)));
        Ok(Self {
            ctx,
            delivery,
            router,
            consumers: Vec::new(),
            watcher: None,
            tasks: Vec::new(),
            subscriptions: Vec::new(),
        })
    }

    pub fn context(&self) -> &Arc<BusContext> {
        &self.ctx
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn delivery(&self) -> &Arc<DeliverySerializer> {
        &self.delivery
    }

    pub fn consumers(&self) -> &[Arc<OffsetConsumer>] {
        &self.consumers
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    /// Start watching, consuming and routing.
    ///
    /// Subscriptions go in before the watcher so no arrival is published
    /// to an empty listener map; the recovery sweep runs after the watcher
    /// so nothing written during startup is missed.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let config = &self.ctx.config;
        info!(root = %config.root.display(), "Starting bus");

        let router = Arc::clone(&self.router);
        self.subscriptions.push(self.ctx.dispatcher.subscribe_async(
            topics::ANY_MESSAGE,
            SubscribeOptions::priority(10),
            move |event| {
                let router = Arc::clone(&router);
                async move {
                    if let EventPayload::MessageArrived(arrived) = &event.payload {
                        router.handle_arrival(arrived).await?;
                    }
                    Ok(())
                }
            },
        ));

        if config.consumers {
            for (domain, participant) in self.ctx.known_participants()? {
                self.add_consumer(&domain, &participant)?;
            }
        }

        let layer = Arc::new(WatchLayer::new(
            self.ctx.paths.clone(),
            Arc::clone(&self.ctx.dispatcher),
            Arc::clone(&self.ctx.ignore),
            self.ctx.resolver.clone(),
        ));
        self.watcher = Some(FsWatcher::start(self.ctx.paths.root(), layer)?);

        if let Err(e) = self.router.recover().await {
            warn!("Recovery sweep incomplete: {}", e);
        }
        for consumer in &self.consumers {
            if let Err(e) = consumer.scan().await {
                warn!(consumer = %consumer.id(), "Startup scan failed: {}", e);
            }
        }

        let poll = self.ctx.config.consumer_poll_interval();
        for consumer in &self.consumers {
            self.tasks.push(tokio::spawn(Arc::clone(consumer).run_poll(poll)));
        }
        self.tasks.push(self.spawn_stuck_check());

        info!(consumers = self.consumers.len(), "Bus started");
        Ok(())
    }

    /// Register a consumer for one participant. Only subscribes; the caller
    /// (or `start`) runs the scan and poll.
    pub fn add_consumer(&mut self, domain: &str, participant: &str) -> Result<Arc<OffsetConsumer>> {
        if let Some(existing) = self
            .consumers
            .iter()
            .find(|c| c.domain() == domain && c.participant() == participant)
        {
            return Ok(Arc::clone(existing));
        }
        let consumer = Arc::new(OffsetConsumer::new(
            Arc::clone(&self.ctx),
            Arc::clone(&self.delivery),
            domain,
            participant,
        )?);
        let handler = Arc::clone(&consumer);
        self.subscriptions.push(self.ctx.dispatcher.subscribe_async(
            topics::LOG,
            SubscribeOptions::default(),
            move |event| {
                let consumer = Arc::clone(&handler);
                async move {
                    if let EventPayload::MessageArrived(arrived) = &event.payload {
                        if consumer.is_addressed(arrived.file_name()) {
                            consumer.process_message(&arrived.path).await?;
                        }
                    }
                    Ok(())
                }
            },
        ));
        debug!(consumer = %consumer.id(), "Consumer registered");
        self.consumers.push(Arc::clone(&consumer));
        Ok(consumer)
    }

    fn spawn_stuck_check(&self) -> JoinHandle<()> {
        let router = Arc::clone(&self.router);
        let threshold = self.ctx.config.stuck_after();
        let every = self.ctx.config.stuck_check_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                match router.scan_stuck(threshold) {
                    Ok(0) => {}
                    Ok(n) => info!(count = n, "Stuck messages reported"),
                    Err(e) => warn!("Stuck-message scan failed: {}", e),
                }
            }
        })
    }

    /// Stop the watcher and timers. On-disk state is left exactly as it is.
    pub fn stop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for id in self.subscriptions.drain(..) {
            self.ctx.dispatcher.unsubscribe(id);
        }
        self.consumers.clear();
        info!("Bus stopped");
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
