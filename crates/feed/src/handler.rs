//! Feed handler: binds the subscription registry, the event router and the
//! persistence store to the connection supervisor.

use crate::ack::PendingAcks;
use crate::registry::{Desired, SubscriptionRegistry};
use crate::router::{DeliveryConfig, EventRouter};
use crate::sink::NotificationSink;
use crate::store::PersistenceStore;
use async_trait::async_trait;
use common::codec::{self, InboundFrame, ReplyStatus};
use common::error::{Error, Result};
use common::{
    AckStatus, CollectionSlug, ControlCommand, EventFilter, EventKind, Outbox, SubscribeOutcome,
    SubscriberId, SubscriberView, TopicStatus, UnsubscribeOutcome, WsHandler,
};
use metrics::{counter, gauge};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Default bound on waiting for a subscribe's join ack.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

enum SubscribeStep {
    Done(SubscribeOutcome),
    /// Answer once the join with this ref is acknowledged.
    Await {
        reference: u64,
        collection: CollectionSlug,
    },
}

/// [`WsHandler`] for the collection feed.
///
/// Owned by the supervisor task, so registry mutations, persistence and
/// frame handling are serialized without locks.
pub struct FeedHandler<St> {
    registry: SubscriptionRegistry,
    router: EventRouter,
    store: St,
    pending: PendingAcks,
    ack_timeout: Duration,
    label: String,
    /// Set once automatic reconnection gave up.
    exhausted: Option<u32>,
}

impl<St: PersistenceStore> FeedHandler<St> {
    /// Must be called within a tokio runtime: spawns the notification
    /// delivery task.
    pub fn new<S: NotificationSink>(
        registry: SubscriptionRegistry,
        store: St,
        sink: S,
        label: impl Into<String>,
        ack_timeout: Duration,
        delivery: DeliveryConfig,
    ) -> Self {
        let label = label.into();
        Self {
            registry,
            router: EventRouter::spawn(sink, label.clone(), delivery),
            store,
            pending: PendingAcks::new(),
            ack_timeout,
            label,
            exhausted: None,
        }
    }

    /// Write the desired state through; on failure put `before` back so
    /// memory never runs ahead of storage.
    async fn persist(&mut self, before: Desired) -> Result<()> {
        match self.store.save(&self.registry.to_state()).await {
            Ok(()) => {
                report_active_collections(&self.label, &self.registry);
                Ok(())
            }
            Err(e) => {
                error!("[{}] Failed to persist subscriptions, change reverted: {}", self.label, e);
                counter!("feed_errors_total", "feed" => self.label.clone(), "error_type" => e.kind()).increment(1);
                self.registry.restore(before);
                Err(e)
            }
        }
    }

    async fn subscribe(
        &mut self,
        subscriber: &SubscriberId,
        collection: &str,
        kinds: Option<Vec<EventKind>>,
        outbox: Option<&mut Outbox>,
    ) -> Result<SubscribeStep> {
        let slug = CollectionSlug::parse(collection)?;
        let before = self.registry.desired().clone();
        let activated = self
            .registry
            .subscribe(subscriber, &slug, kinds.map(EventFilter::from_kinds))?;
        self.persist(before).await?;
        info!("[{}] {} subscribed to {}", self.label, subscriber, slug);

        if let Some(attempts) = self.exhausted {
            return Err(Error::ReconnectionExhausted { attempts });
        }
        let Some(outbox) = outbox else {
            debug!("[{}] Not connected; {} joins on next connect", self.label, slug);
            return Ok(SubscribeStep::Done(SubscribeOutcome::Pending));
        };

        let generation = outbox.generation();
        if activated {
            let reference = outbox.join(codec::collection_topic(&slug));
            self.registry.record_join(&slug, reference, generation);
            debug!("[{}] Joining {} (ref {})", self.label, slug, reference);
            return Ok(SubscribeStep::Await {
                reference,
                collection: slug,
            });
        }

        // Already active: piggyback on the existing join.
        Ok(match self.registry.handle(&slug) {
            Some(h) if h.generation == generation && h.status == AckStatus::Confirmed => {
                SubscribeStep::Done(SubscribeOutcome::Confirmed)
            }
            Some(h) if h.generation == generation && h.status == AckStatus::Pending => {
                SubscribeStep::Await {
                    reference: h.reference,
                    collection: slug,
                }
            }
            _ => SubscribeStep::Done(SubscribeOutcome::Pending),
        })
    }

    async fn unsubscribe(
        &mut self,
        subscriber: &SubscriberId,
        collection: &str,
        outbox: Option<&mut Outbox>,
    ) -> Result<UnsubscribeOutcome> {
        let slug = CollectionSlug::parse(collection)?;
        let before = self.registry.desired().clone();
        let deactivated = self.registry.unsubscribe(subscriber, &slug)?;
        self.persist(before).await?;
        info!("[{}] {} unsubscribed from {}", self.label, subscriber, slug);

        if !deactivated {
            return Ok(UnsubscribeOutcome::Retained);
        }
        self.leave(&slug, outbox);
        Ok(UnsubscribeOutcome::Left)
    }

    async fn clear_all(
        &mut self,
        subscriber: &SubscriberId,
        mut outbox: Option<&mut Outbox>,
    ) -> Result<Vec<CollectionSlug>> {
        if !self.registry.has_subscriber(subscriber) {
            return Ok(Vec::new());
        }
        let removed = self.registry.subscriptions_of(subscriber).to_vec();
        let before = self.registry.desired().clone();
        let deactivated = self.registry.clear(subscriber);
        self.persist(before).await?;
        info!(
            "[{}] Cleared {} subscriptions of {}",
            self.label,
            removed.len(),
            subscriber
        );

        for slug in &deactivated {
            self.leave(slug, outbox.as_deref_mut());
        }
        Ok(removed)
    }

    async fn set_filter(&mut self, subscriber: &SubscriberId, kinds: Vec<EventKind>) -> Result<()> {
        let before = self.registry.desired().clone();
        self.registry
            .set_filter(subscriber, EventFilter::from_kinds(kinds));
        self.persist(before).await?;
        debug!("[{}] Updated filter of {}", self.label, subscriber);
        Ok(())
    }

    /// Discard the handle of a collection that went inactive and, if its
    /// join is live on this connection, leave the topic.
    fn leave(&mut self, slug: &CollectionSlug, outbox: Option<&mut Outbox>) {
        let Some(handle) = self.registry.discard_handle(slug) else {
            return;
        };
        self.pending.resolve(handle.reference, |_| Err(Error::Cancelled));
        if handle.status == AckStatus::Failed {
            return;
        }
        if let Some(outbox) = outbox {
            let reference = outbox.leave(codec::collection_topic(slug), handle.reference);
            debug!("[{}] Leaving {} (ref {})", self.label, slug, reference);
        }
    }

    fn status(&self) -> Vec<TopicStatus> {
        self.registry
            .active_collections()
            .iter()
            .map(|slug| TopicStatus {
                collection: slug.clone(),
                subscribers: self.registry.holder_count(slug),
                status: self.registry.handle(slug).map(|h| h.status),
            })
            .collect()
    }

    fn on_reply(&mut self, reference: u64, status: ReplyStatus, detail: Option<String>, generation: u64) {
        let ok = status == ReplyStatus::Ok;
        let Some(slug) = self.registry.apply_ack(reference, generation, ok) else {
            debug!("[{}] Reply to ref {} ({:?})", self.label, reference, status);
            return;
        };

        if ok {
            debug!("[{}] Join of {} confirmed (ref {})", self.label, slug, reference);
            self.pending
                .resolve(reference, |_| Ok(SubscribeOutcome::Confirmed));
            return;
        }

        let detail = detail.unwrap_or_else(|| "no reason given".to_string());
        warn!(
            "[{}] Upstream rejected join of {}: {}; retrying after the next reconnect",
            self.label, slug, detail
        );
        counter!("feed_errors_total", "feed" => self.label.clone(), "error_type" => "ack_rejected").increment(1);
        self.pending.resolve(reference, |collection| {
            Err(Error::AckRejected {
                collection: collection.to_string(),
                detail: detail.clone(),
            })
        });
    }

    fn on_topic_closed(&mut self, topic: &str) {
        let Some(slug) = codec::slug_from_topic(topic) else {
            debug!("[{}] Topic {} closed", self.label, topic);
            return;
        };
        let Some(reference) = self.registry.mark_closed(&slug) else {
            return;
        };
        warn!(
            "[{}] Upstream closed {}; rejoining after the next reconnect",
            self.label, topic
        );
        self.pending.resolve(reference, |collection| {
            Err(Error::AckRejected {
                collection: collection.to_string(),
                detail: "topic closed by upstream".to_string(),
            })
        });
    }
}

pub(crate) fn report_active_collections(label: &str, registry: &SubscriptionRegistry) {
    gauge!("feed_active_collections", "feed" => label.to_string())
        .set(registry.active_collections().len() as f64);
}

/// Validation failures are the caller's business, not ours to alarm about.
fn log_rejected(label: &str, op: &str, e: &Error) {
    match e {
        Error::InvalidSlug(_)
        | Error::CapacityExceeded { .. }
        | Error::AlreadySubscribed { .. }
        | Error::NotSubscribed { .. } => debug!("[{}] {} refused: {}", label, op, e),
        _ => warn!("[{}] {} failed: {}", label, op, e),
    }
}

#[async_trait]
impl<St: PersistenceStore> WsHandler for FeedHandler<St> {
    async fn on_connected(&mut self, outbox: &mut Outbox) {
        self.registry.begin_reconcile(outbox.generation());
        info!(
            "[{}] Reconciling {} active collections",
            self.label,
            self.registry.active_collections().len()
        );
    }

    async fn on_frame(&mut self, frame: InboundFrame, outbox: &mut Outbox) {
        match frame {
            InboundFrame::Reply {
                reference,
                status,
                detail,
                ..
            } => self.on_reply(reference, status, detail, outbox.generation()),
            InboundFrame::TopicClosed { topic } => self.on_topic_closed(&topic),
            InboundFrame::Event(event) => {
                self.router.route(event, &self.registry);
            }
            InboundFrame::Other { topic, event } => {
                debug!("[{}] Ignoring {} on {}", self.label, event, topic);
            }
        }
    }

    async fn on_disconnected(&mut self, reason: &str) {
        self.registry.invalidate_handles();
        let waiting = self
            .pending
            .resolve_all(|_| Ok(SubscribeOutcome::Pending));
        if waiting > 0 {
            info!(
                "[{}] Disconnected ({}); {} subscribes left pending",
                self.label, reason, waiting
            );
        }
    }

    async fn on_exhausted(&mut self, attempts: u32) {
        self.exhausted = Some(attempts);
        error!(
            "[{}] Feed unreachable; {} subscriptions kept for the next start",
            self.label,
            self.registry.active_collections().len()
        );
    }

    async fn handle_command(&mut self, cmd: ControlCommand, outbox: Option<&mut Outbox>) {
        match cmd {
            ControlCommand::Subscribe {
                subscriber,
                collection,
                kinds,
                reply,
            } => match self.subscribe(&subscriber, &collection, kinds, outbox).await {
                Ok(SubscribeStep::Done(outcome)) => {
                    let _ = reply.send(Ok(outcome));
                }
                Ok(SubscribeStep::Await {
                    reference,
                    collection,
                }) => {
                    let deadline = Instant::now() + self.ack_timeout;
                    self.pending.wait(reference, collection, deadline, reply);
                }
                Err(e) => {
                    log_rejected(&self.label, "subscribe", &e);
                    let _ = reply.send(Err(e));
                }
            },
            ControlCommand::Unsubscribe {
                subscriber,
                collection,
                reply,
            } => {
                let result = self.unsubscribe(&subscriber, &collection, outbox).await;
                if let Err(e) = &result {
                    log_rejected(&self.label, "unsubscribe", e);
                }
                let _ = reply.send(result);
            }
            ControlCommand::ClearAll { subscriber, reply } => {
                let result = self.clear_all(&subscriber, outbox).await;
                if let Err(e) = &result {
                    log_rejected(&self.label, "clear", e);
                }
                let _ = reply.send(result);
            }
            ControlCommand::SetFilter {
                subscriber,
                kinds,
                reply,
            } => {
                let result = self.set_filter(&subscriber, kinds).await;
                if let Err(e) = &result {
                    log_rejected(&self.label, "set filter", e);
                }
                let _ = reply.send(result);
            }
            ControlCommand::Subscriptions { subscriber, reply } => {
                let _ = reply.send(SubscriberView {
                    collections: self.registry.subscriptions_of(&subscriber).to_vec(),
                    filter: self.registry.filter_of(&subscriber).cloned(),
                });
            }
            ControlCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            // Intercepted by the supervisor.
            ControlCommand::Shutdown => {}
        }
    }

    fn has_paced_work(&self) -> bool {
        self.registry.reconcile_pending()
    }

    fn on_pace(&mut self, outbox: &mut Outbox) {
        let generation = outbox.generation();
        if let Some(slug) = self.registry.next_reconcile(generation) {
            let reference = outbox.join(codec::collection_topic(&slug));
            self.registry.record_join(&slug, reference, generation);
            debug!("[{}] Rejoining {} (ref {})", self.label, slug, reference);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.next_deadline()
    }

    fn on_deadline(&mut self, now: Instant) {
        for slug in self.pending.expire(now) {
            warn!(
                "[{}] Join of {} not acknowledged within {:?}; kept for reconciliation",
                self.label, slug, self.ack_timeout
            );
            counter!("feed_errors_total", "feed" => self.label.clone(), "error_type" => "ack_timeout").increment(1);
        }
    }

    async fn on_shutdown(&mut self) {
        let cancelled = self.pending.resolve_all(|_| Err(Error::Cancelled));
        if cancelled > 0 {
            info!("[{}] Cancelled {} pending subscribes", self.label, cancelled);
        }
    }
}
