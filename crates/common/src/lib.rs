//! Shared building blocks for the collection feed client: domain types, the
//! topic protocol codec, the transport abstraction and the connection
//! supervisor that keeps one upstream connection alive.

pub mod codec;
pub mod error;
pub mod messages;
pub mod outbox;
pub mod supervisor;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
pub mod types;
pub mod ws_handler;

pub use codec::{DomainEvent, InboundFrame, OutboundFrame, ReplyStatus};
pub use error::{Error, Result};
pub use messages::{
    ControlCommand, FeedStatus, SubscribeOutcome, SubscriberView, TopicStatus, UnsubscribeOutcome,
};
pub use outbox::Outbox;
pub use supervisor::{ConnectionSupervisor, SupervisorConfig};
pub use transport::{Connector, Transport, WsConnector};
pub use types::{
    AckStatus, CollectionSlug, ConnectionState, EventFilter, EventKind, SubscriberId, TopicHandle,
};
pub use ws_handler::WsHandler;
