//! Domain types shared by the codec, the supervisor and the registry.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Opaque subscriber identifier (e.g. a chat platform user id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Collection identifier. Always matches `^[a-z0-9-]+$`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CollectionSlug(String);

impl CollectionSlug {
    /// Validate a slug. Case-sensitive: upper-case input is rejected, not folded.
    pub fn parse(raw: &str) -> Result<Self> {
        let valid = !raw.is_empty()
            && raw
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(Error::InvalidSlug(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CollectionSlug {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for CollectionSlug {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Event kinds the feed publishes. Fixed at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    ListingCreated,
    ItemSold,
    ItemTransferred,
    OfferReceived,
    BidReceived,
    MetadataUpdated,
    ListingCancelled,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::ListingCreated,
        EventKind::ItemSold,
        EventKind::ItemTransferred,
        EventKind::OfferReceived,
        EventKind::BidReceived,
        EventKind::MetadataUpdated,
        EventKind::ListingCancelled,
    ];

    /// Canonical name, as stored in persisted filters.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ListingCreated => "listing-created",
            EventKind::ItemSold => "item-sold",
            EventKind::ItemTransferred => "item-transferred",
            EventKind::OfferReceived => "offer-received",
            EventKind::BidReceived => "bid-received",
            EventKind::MetadataUpdated => "metadata-updated",
            EventKind::ListingCancelled => "listing-cancelled",
        }
    }

    /// Event name used on the wire by the upstream feed.
    pub fn wire_name(self) -> &'static str {
        match self {
            EventKind::ListingCreated => "item_listed",
            EventKind::ItemSold => "item_sold",
            EventKind::ItemTransferred => "item_transferred",
            EventKind::OfferReceived => "item_received_offer",
            EventKind::BidReceived => "item_received_bid",
            EventKind::MetadataUpdated => "item_metadata_updated",
            EventKind::ListingCancelled => "item_cancelled",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.wire_name() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event kind '{}'", s))
    }
}

/// Per-subscriber set of event kinds. An empty set matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    kinds: BTreeSet<EventKind>,
}

impl EventFilter {
    /// Filter that explicitly lists every known kind.
    pub fn all() -> Self {
        Self::from_kinds(EventKind::ALL)
    }

    pub fn from_kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
        }
    }

    pub fn matches(&self, kind: EventKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = EventKind> + '_ {
        self.kinds.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

/// Acknowledgement status of a topic join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Live join state for one active collection on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TopicHandle {
    /// Ref of the join frame.
    pub reference: u64,
    /// Connection generation that issued the join.
    pub generation: u64,
    pub status: AckStatus,
}

/// Process-wide connection state published by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
    /// Terminal: automatic reconnection gave up; a restart is required.
    Exhausted,
}

impl ConnectionState {
    /// Numeric value for the connection state gauge.
    pub fn as_gauge(self) -> f64 {
        match self {
            ConnectionState::Disconnected => 0.0,
            ConnectionState::Connecting => 1.0,
            ConnectionState::Connected => 2.0,
            ConnectionState::Draining => 3.0,
            ConnectionState::Exhausted => -1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_grammar() {
        assert!(CollectionSlug::parse("cryptopunks").is_ok());
        assert!(CollectionSlug::parse("bored-ape-yacht-club").is_ok());
        assert!(CollectionSlug::parse("0n1-force").is_ok());
        assert!(matches!(
            CollectionSlug::parse("CryptoPunks"),
            Err(Error::InvalidSlug(_))
        ));
        assert!(CollectionSlug::parse("").is_err());
        assert!(CollectionSlug::parse("azuki elementals").is_err());
        assert!(CollectionSlug::parse("azuki_2").is_err());
    }

    #[test]
    fn test_slug_deserialize_validates() {
        let ok: CollectionSlug = serde_json::from_str("\"azuki\"").unwrap();
        assert_eq!(ok.as_str(), "azuki");
        assert!(serde_json::from_str::<CollectionSlug>("\"Azuki\"").is_err());
    }

    #[test]
    fn test_event_kind_names() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_wire(kind.wire_name()), Some(kind));
            assert_eq!(kind.as_str().parse::<EventKind>(), Ok(kind));
        }
        assert_eq!(EventKind::from_wire("collection_offer"), None);
        assert!("item_sold".parse::<EventKind>().is_err());
        assert_eq!(
            serde_json::to_string(&EventKind::ItemSold).unwrap(),
            "\"item-sold\""
        );
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let empty = EventFilter::default();
        let all = EventFilter::all();
        for kind in EventKind::ALL {
            assert!(empty.matches(kind));
            assert!(all.matches(kind));
        }
        assert_eq!(all.len(), 7);

        let sales = EventFilter::from_kinds([EventKind::ItemSold]);
        assert!(sales.matches(EventKind::ItemSold));
        assert!(!sales.matches(EventKind::BidReceived));
    }
}
