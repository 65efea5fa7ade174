//! Collection feed client: subscription registry, event routing,
//! persistence and notification delivery on top of the connection
//! supervisor from `common`.

pub mod ack;
pub mod client;
pub mod handler;
pub mod registry;
pub mod router;
pub mod sink;
pub mod store;

pub use client::{start, FeedClient, FeedConfig};
pub use handler::FeedHandler;
pub use registry::{SubscriptionRegistry, SubscriptionState, MAX_SUBSCRIPTIONS_PER_SUBSCRIBER};
pub use router::{DeliveryConfig, EventRouter};
pub use sink::{ChannelSink, LogSink, NatsSink, Notification, NotificationSink};
pub use store::{FileStore, MemoryStore, PersistenceStore, RedisStore};
