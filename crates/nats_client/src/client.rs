//! NATS Core client wrapper.

use anyhow::{Context, Result};
use async_nats::{Client, Subscriber};
use bytes::Bytes;
use tracing::info;

/// Wrapper around the NATS client.
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
}

impl NatsClient {
    /// Connect to a NATS server.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);
        let client = async_nats::connect(url)
            .await
            .with_context(|| format!("connecting to NATS at {}", url))?;
        Ok(Self { client })
    }

    /// Subscribe to a subject using NATS Core (low-latency push).
    pub async fn subscribe(&self, subject: &str) -> Result<Subscriber> {
        info!("Subscribing to subject: {}", subject);
        let subscriber = self.client.subscribe(subject.to_string()).await?;
        Ok(subscriber)
    }

    /// Publish a message using NATS Core (fire-and-forget, lowest latency).
    pub async fn publish_fast(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.client.publish(subject.to_string(), payload).await?;
        Ok(())
    }

    /// Flush buffered publishes to the server.
    pub async fn flush(&self) -> Result<()> {
        self.client.flush().await?;
        Ok(())
    }
}

/// Subject a subscriber's notifications are published on.
///
/// NATS treats `.`, `*`, `>` and whitespace as subject syntax, so those are
/// replaced in the subscriber token.
pub fn subscriber_subject(prefix: &str, subscriber: &str) -> String {
    let token: String = subscriber
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    format!("{}.{}", prefix, token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriber_subject() {
        assert_eq!(subscriber_subject("notifications", "12345"), "notifications.12345");
        assert_eq!(subscriber_subject("notifications", "a.b *>"), "notifications.a_b___");
    }
}
