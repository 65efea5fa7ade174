//! Notification sinks: where routed events go once a subscriber matched.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use common::error::{Error, Result};
use common::{CollectionSlug, DomainEvent, EventKind, SubscriberId};
use nats_client::{subscriber_subject, NatsClient};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Default subject prefix for published notifications.
pub const DEFAULT_SUBJECT_PREFIX: &str = "notifications";

/// Message handed to the delivery side for one subscriber.
#[derive(Debug, Clone, Serialize)]
pub struct Notification<'a> {
    pub subscriber: &'a SubscriberId,
    pub kind: EventKind,
    pub collection: Option<&'a CollectionSlug>,
    pub payload: &'a Value,
    /// Unix timestamp in milliseconds.
    pub routed_at: i64,
}

impl<'a> Notification<'a> {
    pub fn new(subscriber: &'a SubscriberId, event: &'a DomainEvent) -> Self {
        Self {
            subscriber,
            kind: event.kind,
            collection: event.collection.as_ref(),
            payload: &event.payload,
            routed_at: Utc::now().timestamp_millis(),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn deliver(&self, subscriber: &SubscriberId, event: &DomainEvent) -> Result<()>;
}

#[async_trait]
impl<S: NotificationSink + ?Sized> NotificationSink for Arc<S> {
    async fn deliver(&self, subscriber: &SubscriberId, event: &DomainEvent) -> Result<()> {
        (**self).deliver(subscriber, event).await
    }
}

/// Publishes notifications on `<prefix>.<subscriber>`.
pub struct NatsSink {
    client: NatsClient,
    prefix: String,
}

impl NatsSink {
    pub fn new(client: NatsClient, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for NatsSink {
    async fn deliver(&self, subscriber: &SubscriberId, event: &DomainEvent) -> Result<()> {
        let subject = subscriber_subject(&self.prefix, subscriber.as_str());
        let payload = serde_json::to_vec(&Notification::new(subscriber, event))?;
        self.client
            .publish_fast(&subject, Bytes::from(payload))
            .await
            .map_err(|e| Error::TransportFailure(format!("publish to {} failed: {}", subject, e)))?;
        debug!("Published {} notification on {}", event.kind, subject);
        Ok(())
    }
}

/// Logs notifications instead of delivering them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, subscriber: &SubscriberId, event: &DomainEvent) -> Result<()> {
        let collection = event
            .collection
            .as_ref()
            .map(CollectionSlug::as_str)
            .unwrap_or("-");
        info!("Notify {}: {} on {}", subscriber, event.kind, collection);
        Ok(())
    }
}

/// Forwards every notification to a channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<(SubscriberId, DomainEvent)>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(SubscriberId, DomainEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn deliver(&self, subscriber: &SubscriberId, event: &DomainEvent) -> Result<()> {
        self.tx
            .send((subscriber.clone(), event.clone()))
            .map_err(|_| Error::TransportFailure("notification channel closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notification_shape() {
        let subscriber = SubscriberId::new("u1");
        let event = DomainEvent {
            topic: "collection:azuki".into(),
            kind: EventKind::ItemSold,
            collection: Some(CollectionSlug::parse("azuki").unwrap()),
            payload: json!({"payload": {"sale_price": "1"}}),
        };
        let value = serde_json::to_value(Notification::new(&subscriber, &event)).unwrap();
        assert_eq!(value["subscriber"], "u1");
        assert_eq!(value["kind"], "item-sold");
        assert_eq!(value["collection"], "azuki");
        assert_eq!(value["payload"]["payload"]["sale_price"], "1");
        assert!(value["routed_at"].as_i64().unwrap() > 0);
    }
}
