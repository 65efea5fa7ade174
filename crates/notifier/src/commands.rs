//! NATS request/reply bridge for subscription commands.
//!
//! The chat front end sends a JSON request such as
//! `{"op": "subscribe", "subscriber": "42", "collection": "azuki"}` and
//! receives `{"status": "ok", "result": ...}` or
//! `{"status": "error", "kind": "...", "error": "..."}`.

use anyhow::Result;
use bytes::Bytes;
use common::{EventKind, SubscriberId};
use feed::FeedClient;
use futures::StreamExt;
use nats_client::NatsClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CommandRequest {
    Subscribe {
        subscriber: String,
        collection: String,
        #[serde(default)]
        kinds: Option<Vec<EventKind>>,
    },
    Unsubscribe {
        subscriber: String,
        collection: String,
    },
    ClearAll {
        subscriber: String,
    },
    SetFilter {
        subscriber: String,
        kinds: Vec<EventKind>,
    },
    Subscriptions {
        subscriber: String,
    },
    Status,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandReply {
    Ok { result: Value },
    Error { kind: &'static str, error: String },
}

impl CommandReply {
    fn failed(e: common::Error) -> Self {
        CommandReply::Error {
            kind: e.kind(),
            error: e.to_string(),
        }
    }
}

fn reply_with<T: Serialize>(result: common::Result<T>) -> CommandReply {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(result) => CommandReply::Ok { result },
            Err(e) => CommandReply::failed(e.into()),
        },
        Err(e) => CommandReply::failed(e),
    }
}

/// Run one command against the feed client.
pub async fn execute(client: &FeedClient, request: CommandRequest) -> CommandReply {
    match request {
        CommandRequest::Subscribe {
            subscriber,
            collection,
            kinds,
        } => reply_with(
            client
                .subscribe(&SubscriberId::new(subscriber), &collection, kinds)
                .await,
        ),
        CommandRequest::Unsubscribe {
            subscriber,
            collection,
        } => reply_with(
            client
                .unsubscribe(&SubscriberId::new(subscriber), &collection)
                .await,
        ),
        CommandRequest::ClearAll { subscriber } => {
            reply_with(client.clear_all(&SubscriberId::new(subscriber)).await)
        }
        CommandRequest::SetFilter { subscriber, kinds } => {
            reply_with(client.set_filter(&SubscriberId::new(subscriber), kinds).await)
        }
        CommandRequest::Subscriptions { subscriber } => {
            reply_with(client.subscriptions(&SubscriberId::new(subscriber)).await)
        }
        CommandRequest::Status => reply_with(client.status().await),
    }
}

/// Decode a request payload and execute it.
pub async fn handle(client: &FeedClient, payload: &[u8]) -> CommandReply {
    match serde_json::from_slice::<CommandRequest>(payload) {
        Ok(request) => {
            debug!("Command: {:?}", request);
            execute(client, request).await
        }
        Err(e) => CommandReply::Error {
            kind: "bad_request",
            error: e.to_string(),
        },
    }
}

/// Serve commands on `subject` until the subscription ends.
pub async fn serve(nats: NatsClient, subject: String, client: FeedClient) -> Result<()> {
    let mut requests = nats.subscribe(&subject).await?;
    info!("Accepting commands on {}", subject);

    while let Some(msg) = requests.next().await {
        let Some(reply_to) = msg.reply.clone() else {
            warn!("Ignoring command on {} without a reply subject", msg.subject);
            continue;
        };
        let nats = nats.clone();
        let client = client.clone();
        // Subscribes may wait on an upstream ack; don't hold up other commands.
        tokio::spawn(async move {
            let reply = handle(&client, &msg.payload).await;
            let sent = match serde_json::to_vec(&reply) {
                Ok(body) => nats.publish_fast(reply_to.as_str(), Bytes::from(body)).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = sent {
                warn!("Failed to answer command: {}", e);
            }
        });
    }

    warn!("Command subscription on {} ended", subject);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::testing::{ConnectPlan, MockConnector};
    use common::SupervisorConfig;
    use feed::{ChannelSink, FeedConfig, MemoryStore};
    use serde_json::json;

    async fn offline_client() -> FeedClient {
        let (connector, _upstream) = MockConnector::new();
        connector.plan(ConnectPlan::Hang, 100);
        let (sink, _rx) = ChannelSink::new();
        let config = FeedConfig {
            supervisor: SupervisorConfig {
                rotation_interval: None,
                ..Default::default()
            },
            ..Default::default()
        };
        let (client, _task) = feed::start(connector, MemoryStore::new(), sink, config)
            .await
            .unwrap();
        client
    }

    #[test]
    fn test_parse_requests() {
        let request: CommandRequest = serde_json::from_value(json!({
            "op": "subscribe",
            "subscriber": "42",
            "collection": "azuki",
            "kinds": ["item-sold", "bid-received"]
        }))
        .unwrap();
        assert_eq!(
            request,
            CommandRequest::Subscribe {
                subscriber: "42".into(),
                collection: "azuki".into(),
                kinds: Some(vec![EventKind::ItemSold, EventKind::BidReceived]),
            }
        );

        let status: CommandRequest = serde_json::from_value(json!({"op": "status"})).unwrap();
        assert_eq!(status, CommandRequest::Status);
        assert!(serde_json::from_value::<CommandRequest>(json!({"op": "teleport"})).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_against_offline_client() {
        let client = offline_client().await;

        let reply = handle(&client, br#"{"op":"subscribe","subscriber":"42","collection":"azuki"}"#).await;
        assert_eq!(serde_json::to_value(&reply).unwrap(), json!({"status": "ok", "result": "pending"}));

        let reply = handle(&client, br#"{"op":"subscriptions","subscriber":"42"}"#).await;
        let CommandReply::Ok { result } = reply else {
            panic!("subscriptions query failed");
        };
        assert_eq!(result["collections"], json!(["azuki"]));
        assert_eq!(result["filter"]["kinds"].as_array().unwrap().len(), 7);

        let reply = handle(&client, br#"{"op":"unsubscribe","subscriber":"42","collection":"doodles"}"#).await;
        assert!(matches!(reply, CommandReply::Error { kind: "not_subscribed", .. }));

        let reply = handle(&client, b"not json").await;
        assert!(matches!(reply, CommandReply::Error { kind: "bad_request", .. }));
    }
}
