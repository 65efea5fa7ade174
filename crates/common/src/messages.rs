//! Control messages for runtime subscription management.

use crate::error::Result;
use crate::types::{
    AckStatus, CollectionSlug, ConnectionState, EventFilter, EventKind, SubscriberId,
};
use serde::Serialize;
use tokio::sync::oneshot;

/// Result of a subscribe that was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscribeOutcome {
    /// The upstream acknowledged the topic join.
    Confirmed,
    /// Recorded while offline (or the topic is not joined on this connection);
    /// the next reconciliation pass joins it.
    Pending,
}

/// Result of a successful unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsubscribeOutcome {
    /// Last subscriber detached; the topic is no longer active.
    Left,
    /// Another subscriber still holds the collection.
    Retained,
}

/// A subscriber's current subscriptions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriberView {
    pub collections: Vec<CollectionSlug>,
    pub filter: Option<EventFilter>,
}

/// Join status of one active collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicStatus {
    pub collection: CollectionSlug,
    pub subscribers: usize,
    /// `None` when no join has been issued on the current connection.
    pub status: Option<AckStatus>,
}

/// Snapshot of the feed client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedStatus {
    pub connection: ConnectionState,
    pub topics: Vec<TopicStatus>,
}

/// Commands sent to the supervisor task.
#[derive(Debug)]
pub enum ControlCommand {
    Subscribe {
        subscriber: SubscriberId,
        collection: String,
        kinds: Option<Vec<EventKind>>,
        reply: oneshot::Sender<Result<SubscribeOutcome>>,
    },
    Unsubscribe {
        subscriber: SubscriberId,
        collection: String,
        reply: oneshot::Sender<Result<UnsubscribeOutcome>>,
    },
    /// Remove every subscription and the filter of one subscriber.
    ClearAll {
        subscriber: SubscriberId,
        reply: oneshot::Sender<Result<Vec<CollectionSlug>>>,
    },
    SetFilter {
        subscriber: SubscriberId,
        kinds: Vec<EventKind>,
        reply: oneshot::Sender<Result<()>>,
    },
    Subscriptions {
        subscriber: SubscriberId,
        reply: oneshot::Sender<SubscriberView>,
    },
    Status {
        reply: oneshot::Sender<Vec<TopicStatus>>,
    },
    /// Graceful shutdown
    Shutdown,
}
