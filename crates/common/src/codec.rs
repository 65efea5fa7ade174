//! Topic protocol codec.
//!
//! Frames are Phoenix-channel style JSON objects:
//! `{"topic": "...", "event": "...", "payload": {...}, "ref": 1}`.
//! Encoding and decoding are stateless; ref allocation lives in [`crate::Outbox`].

use crate::error::{Error, Result};
use crate::types::{CollectionSlug, EventKind};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Topic carrying liveness heartbeats.
pub const CONTROL_TOPIC: &str = "phoenix";

/// Prefix of per-collection topics.
pub const COLLECTION_TOPIC_PREFIX: &str = "collection:";

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_HEARTBEAT: &str = "heartbeat";

/// Topic name for a collection.
pub fn collection_topic(slug: &CollectionSlug) -> String {
    format!("{}{}", COLLECTION_TOPIC_PREFIX, slug)
}

/// Collection slug encoded in a topic name, if it is a collection topic.
pub fn slug_from_topic(topic: &str) -> Option<CollectionSlug> {
    topic
        .strip_prefix(COLLECTION_TOPIC_PREFIX)
        .and_then(|raw| CollectionSlug::parse(raw).ok())
}

/// Outbound frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub topic: String,
    pub event: String,
    pub payload: Value,
    #[serde(rename = "ref")]
    pub reference: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub join_ref: Option<u64>,
}

impl OutboundFrame {
    pub fn join(topic: String, reference: u64) -> Self {
        Self {
            topic,
            event: EVENT_JOIN.to_string(),
            payload: Value::Object(Default::default()),
            reference,
            join_ref: None,
        }
    }

    pub fn leave(topic: String, reference: u64, join_ref: u64) -> Self {
        Self {
            topic,
            event: EVENT_LEAVE.to_string(),
            payload: Value::Object(Default::default()),
            reference,
            join_ref: Some(join_ref),
        }
    }

    pub fn heartbeat(reference: u64) -> Self {
        Self {
            topic: CONTROL_TOPIC.to_string(),
            event: EVENT_HEARTBEAT.to_string(),
            payload: Value::Object(Default::default()),
            reference,
            join_ref: None,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Status carried by an ack reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// Domain event published on a collection topic.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub topic: String,
    pub kind: EventKind,
    /// Originating collection, when the payload names a valid one.
    pub collection: Option<CollectionSlug>,
    pub payload: Value,
}

/// Decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Reply {
        topic: String,
        reference: u64,
        status: ReplyStatus,
        detail: Option<String>,
    },
    TopicClosed {
        topic: String,
    },
    Event(DomainEvent),
    Other {
        topic: String,
        event: String,
    },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default, deserialize_with = "deserialize_ref")]
    reference: Option<u64>,
}

/// Refs arrive as numbers or numeric strings; `null` means absent.
fn deserialize_ref<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<u64>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("ref is not a non-negative integer")),
        Some(Value::String(s)) => s
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom("ref string is not numeric")),
        Some(other) => Err(serde::de::Error::custom(format!("unexpected ref {}", other))),
    }
}

/// Decode one inbound text frame.
pub fn decode(text: &str) -> Result<InboundFrame> {
    let raw: RawFrame =
        serde_json::from_str(text).map_err(|e| Error::MalformedFrame(e.to_string()))?;

    match raw.event.as_str() {
        EVENT_REPLY => {
            let reference = raw
                .reference
                .ok_or_else(|| Error::MalformedFrame(format!("reply on {} without ref", raw.topic)))?;
            let status = match raw.payload.get("status").and_then(Value::as_str) {
                Some("ok") => ReplyStatus::Ok,
                Some("error") => ReplyStatus::Error,
                other => {
                    return Err(Error::MalformedFrame(format!(
                        "reply {} has status {:?}",
                        reference, other
                    )))
                }
            };
            Ok(InboundFrame::Reply {
                topic: raw.topic,
                reference,
                status,
                detail: reply_detail(&raw.payload),
            })
        }
        EVENT_CLOSE | EVENT_ERROR => Ok(InboundFrame::TopicClosed { topic: raw.topic }),
        name => match EventKind::from_wire(name) {
            Some(kind) => {
                if !raw.payload.is_object() {
                    return Err(Error::MalformedFrame(format!(
                        "{} event on {} has non-object payload",
                        name, raw.topic
                    )));
                }
                let collection = collection_of(&raw.payload);
                Ok(InboundFrame::Event(DomainEvent {
                    topic: raw.topic,
                    kind,
                    collection,
                    payload: raw.payload,
                }))
            }
            None => Ok(InboundFrame::Other {
                topic: raw.topic,
                event: raw.event,
            }),
        },
    }
}

fn reply_detail(payload: &Value) -> Option<String> {
    let response = payload.get("response")?;
    if let Some(reason) = response.get("reason").and_then(Value::as_str) {
        return Some(reason.to_string());
    }
    match response {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        other => Some(other.to_string()),
    }
}

/// Collection slug carried by an event payload.
fn collection_of(payload: &Value) -> Option<CollectionSlug> {
    payload
        .pointer("/payload/collection/slug")
        .or_else(|| payload.pointer("/collection/slug"))
        .and_then(Value::as_str)
        .and_then(|raw| CollectionSlug::parse(raw).ok())
}
