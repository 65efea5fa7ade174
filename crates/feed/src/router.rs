//! Event router: upstream domain event → matching subscribers.
//!
//! Routing runs on the supervisor task and only queues deliveries; a
//! separate delivery task drains the queue into the notification sink, so a
//! slow sink never holds up heartbeats, commands or ack deadlines.

use crate::registry::SubscriptionRegistry;
use crate::sink::NotificationSink;
use common::{DomainEvent, SubscriberId};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Default number of deliveries queued before new ones are dropped.
pub const DEFAULT_DELIVERY_BUFFER: usize = 1024;

/// Default bound on a single sink delivery.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Capacity of the delivery queue.
    pub buffer: usize,
    /// A delivery still running after this long is abandoned.
    pub timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            buffer: DEFAULT_DELIVERY_BUFFER,
            timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }
}

struct Delivery {
    subscriber: SubscriberId,
    event: Arc<DomainEvent>,
}

/// Fans a domain event out to every subscriber holding its collection whose
/// filter admits the event kind.
pub struct EventRouter {
    deliveries: mpsc::Sender<Delivery>,
    label: String,
}

impl EventRouter {
    /// Create a router and spawn its delivery task. The task drains what is
    /// queued and exits once the router is dropped.
    pub fn spawn<S: NotificationSink>(sink: S, label: impl Into<String>, config: DeliveryConfig) -> Self {
        let label = label.into();
        let (deliveries, queue) = mpsc::channel(config.buffer.max(1));
        tokio::spawn(deliver_queued(sink, queue, label.clone(), config.timeout));
        Self { deliveries, label }
    }

    /// Route one event. Returns the number of deliveries queued.
    pub fn route(&self, event: DomainEvent, registry: &SubscriptionRegistry) -> usize {
        counter!("feed_events_received_total", "feed" => self.label.clone(), "kind" => event.kind.as_str()).increment(1);

        let Some(collection) = event.collection.as_ref() else {
            warn!(
                "[{}] Dropping {} event on {}: no collection in payload",
                self.label, event.kind, event.topic
            );
            counter!("feed_errors_total", "feed" => self.label.clone(), "error_type" => "event_without_collection").increment(1);
            return 0;
        };

        let recipients: Vec<SubscriberId> = registry
            .subscribers_of(collection)
            .filter(|(_, filter)| filter.map_or(true, |f| f.matches(event.kind)))
            .map(|(subscriber, _)| subscriber.clone())
            .collect();

        if recipients.is_empty() {
            debug!("[{}] No subscribers for {} on {}", self.label, event.kind, collection);
            return 0;
        }

        let event = Arc::new(event);
        let mut queued = 0;
        for subscriber in recipients {
            let delivery = Delivery {
                subscriber,
                event: Arc::clone(&event),
            };
            match self.deliveries.try_send(delivery) {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(dropped)) => {
                    warn!(
                        "[{}] Delivery queue full, dropping {} for {}",
                        self.label, event.kind, dropped.subscriber
                    );
                    counter!("feed_notifications_dropped_total", "feed" => self.label.clone()).increment(1);
                }
                Err(TrySendError::Closed(dropped)) => {
                    warn!(
                        "[{}] Delivery task gone, dropping {} for {}",
                        self.label, event.kind, dropped.subscriber
                    );
                    counter!("feed_notifications_failed_total", "feed" => self.label.clone()).increment(1);
                }
            }
        }

        debug!(
            "[{}] Queued {} on {} for {} subscribers",
            self.label, event.kind, event.topic, queued
        );
        queued
    }
}

async fn deliver_queued<S: NotificationSink>(
    sink: S,
    mut queue: mpsc::Receiver<Delivery>,
    label: String,
    timeout: Duration,
) {
    while let Some(Delivery { subscriber, event }) = queue.recv().await {
        match tokio::time::timeout(timeout, sink.deliver(&subscriber, &event)).await {
            Ok(Ok(())) => {
                counter!("feed_notifications_routed_total", "feed" => label.clone()).increment(1);
            }
            Ok(Err(e)) => {
                warn!("[{}] Failed to notify {} of {}: {}", label, subscriber, event.kind, e);
                counter!("feed_notifications_failed_total", "feed" => label.clone()).increment(1);
            }
            Err(_) => {
                warn!(
                    "[{}] Notifying {} of {} timed out after {:?}",
                    label, subscriber, event.kind, timeout
                );
                counter!("feed_notifications_failed_total", "feed" => label.clone()).increment(1);
            }
        }
    }
    debug!("[{}] Notification delivery stopped", label);
}
