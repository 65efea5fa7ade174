//! Thin NATS client used to hand routed notifications to downstream renderers.

pub mod client;

pub use client::{subscriber_subject, NatsClient};
