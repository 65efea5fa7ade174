//! Public handle for the feed client and the function that starts it.

use crate::handler::{report_active_collections, FeedHandler, DEFAULT_ACK_TIMEOUT};
use crate::router::DeliveryConfig;
use crate::registry::SubscriptionRegistry;
use crate::sink::NotificationSink;
use crate::store::PersistenceStore;
use common::error::{Error, Result};
use common::{
    CollectionSlug, ConnectionState, ConnectionSupervisor, Connector, ControlCommand, EventKind,
    FeedStatus, SubscribeOutcome, SubscriberId, SubscriberView, SupervisorConfig,
    UnsubscribeOutcome,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub supervisor: SupervisorConfig,
    /// Bound on waiting for a subscribe's join ack.
    pub ack_timeout: Duration,
    /// Capacity of the command channel.
    pub command_buffer: usize,
    /// Notification delivery queue and per-delivery bound.
    pub delivery: DeliveryConfig,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            command_buffer: 64,
            delivery: DeliveryConfig::default(),
        }
    }
}

/// Load persisted subscriptions and spawn the supervisor.
///
/// Returns the client handle and the supervisor task; the task resolves to
/// `ReconnectionExhausted` if automatic reconnection gave up.
pub async fn start<C, St, S>(
    connector: C,
    store: St,
    sink: S,
    config: FeedConfig,
) -> Result<(FeedClient, JoinHandle<Result<()>>)>
where
    C: Connector,
    St: PersistenceStore,
    S: NotificationSink,
{
    let stored = store.load().await?;
    let registry = SubscriptionRegistry::load(stored.clone());
    let sanitized = registry.to_state();
    if sanitized != stored {
        info!("Rewriting stored subscriptions without dropped entries");
        store.save(&sanitized).await?;
    }
    info!(
        "Loaded {} subscribers across {} collections",
        sanitized.subscriptions.len(),
        registry.active_collections().len()
    );
    report_active_collections(&config.supervisor.label, &registry);

    let handler = FeedHandler::new(
        registry,
        store,
        sink,
        config.supervisor.label.clone(),
        config.ack_timeout,
        config.delivery,
    );
    let (commands, command_rx) = mpsc::channel(config.command_buffer);
    let supervisor = ConnectionSupervisor::new(connector, handler, config.supervisor, command_rx);
    let state = supervisor.state();
    let task = tokio::spawn(supervisor.run());

    Ok((FeedClient { commands, state }, task))
}

/// Cloneable handle used by the command surface.
#[derive(Clone)]
pub struct FeedClient {
    commands: mpsc::Sender<ControlCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl FeedClient {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ControlCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)
    }

    /// Subscribe to a collection. `kinds` replaces the subscriber's filter
    /// when given. Waits for the upstream ack while connected.
    pub async fn subscribe(
        &self,
        subscriber: &SubscriberId,
        collection: &str,
        kinds: Option<Vec<EventKind>>,
    ) -> Result<SubscribeOutcome> {
        self.request(|reply| ControlCommand::Subscribe {
            subscriber: subscriber.clone(),
            collection: collection.to_string(),
            kinds,
            reply,
        })
        .await?
    }

    pub async fn unsubscribe(&self, subscriber: &SubscriberId, collection: &str) -> Result<UnsubscribeOutcome> {
        self.request(|reply| ControlCommand::Unsubscribe {
            subscriber: subscriber.clone(),
            collection: collection.to_string(),
            reply,
        })
        .await?
    }

    /// Drop every subscription and the filter of a subscriber. Returns the
    /// collections that were removed.
    pub async fn clear_all(&self, subscriber: &SubscriberId) -> Result<Vec<CollectionSlug>> {
        self.request(|reply| ControlCommand::ClearAll {
            subscriber: subscriber.clone(),
            reply,
        })
        .await?
    }

    pub async fn set_filter(&self, subscriber: &SubscriberId, kinds: Vec<EventKind>) -> Result<()> {
        self.request(|reply| ControlCommand::SetFilter {
            subscriber: subscriber.clone(),
            kinds,
            reply,
        })
        .await?
    }

    pub async fn subscriptions(&self, subscriber: &SubscriberId) -> Result<SubscriberView> {
        self.request(|reply| ControlCommand::Subscriptions {
            subscriber: subscriber.clone(),
            reply,
        })
        .await
    }

    pub async fn status(&self) -> Result<FeedStatus> {
        let topics = self.request(|reply| ControlCommand::Status { reply }).await?;
        Ok(FeedStatus {
            connection: self.state(),
            topics,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Ask the supervisor to stop. Pending subscribes resolve as `Cancelled`.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(ControlCommand::Shutdown).await;
    }
}
