//! Subscription registry: desired state (who wants which collection) and
//! issued state (which topics have a live join on the current connection).
//!
//! The registry performs no I/O. The feed handler owns the only instance and
//! is its only writer.

use common::error::{Error, Result};
use common::{AckStatus, CollectionSlug, EventFilter, EventKind, SubscriberId, TopicHandle};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::warn;

/// Maximum collections one subscriber may hold.
pub const MAX_SUBSCRIPTIONS_PER_SUBSCRIBER: usize = 3;

/// Persisted document: subscriber -> ordered slugs, subscriber -> kinds.
///
/// Kept as raw strings so unknown slugs or kinds in stored data can be
/// dropped on load instead of failing the whole document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
    #[serde(default)]
    pub subscriptions: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub filters: BTreeMap<String, Vec<String>>,
}

/// Desired state; cloned before a mutation so it can be restored when the
/// write-through save fails.
#[derive(Debug, Clone, Default)]
pub struct Desired {
    subscriptions: HashMap<SubscriberId, Vec<CollectionSlug>>,
    filters: HashMap<SubscriberId, EventFilter>,
    /// Active collections in the order they became active.
    active: Vec<CollectionSlug>,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    desired: Desired,
    handles: HashMap<CollectionSlug, TopicHandle>,
    /// Collections still to be joined by the running reconciliation pass.
    reconcile_queue: VecDeque<CollectionSlug>,
    reconcile_generation: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from persisted state, dropping entries that do not validate.
    pub fn load(state: SubscriptionState) -> Self {
        let mut desired = Desired::default();

        for (subscriber, slugs) in state.subscriptions {
            let subscriber = SubscriberId::new(subscriber);
            let mut kept: Vec<CollectionSlug> = Vec::new();
            for raw in slugs {
                let slug = match CollectionSlug::parse(&raw) {
                    Ok(slug) => slug,
                    Err(_) => {
                        warn!("Dropping stored subscription {} -> '{}': invalid slug", subscriber, raw);
                        continue;
                    }
                };
                if kept.contains(&slug) {
                    warn!("Dropping duplicate stored subscription {} -> {}", subscriber, slug);
                    continue;
                }
                if kept.len() >= MAX_SUBSCRIPTIONS_PER_SUBSCRIBER {
                    warn!("Dropping stored subscription {} -> {}: over the limit", subscriber, slug);
                    continue;
                }
                if !desired.active.contains(&slug) {
                    desired.active.push(slug.clone());
                }
                kept.push(slug);
            }
            if !kept.is_empty() {
                desired.subscriptions.insert(subscriber, kept);
            }
        }

        for (subscriber, raw_kinds) in state.filters {
            let subscriber = SubscriberId::new(subscriber);
            let kinds: Vec<EventKind> = raw_kinds
                .iter()
                .filter_map(|raw| match raw.parse::<EventKind>() {
                    Ok(kind) => Some(kind),
                    Err(e) => {
                        warn!("Dropping stored filter entry for {}: {}", subscriber, e);
                        None
                    }
                })
                .collect();
            // An empty filter matches every kind, which is also what a list
            // of only unknown kinds degrades to.
            desired.filters.insert(subscriber, EventFilter::from_kinds(kinds));
        }

        Self {
            desired,
            ..Self::default()
        }
    }

    /// Persistable form of the desired state.
    pub fn to_state(&self) -> SubscriptionState {
        let subscriptions = self
            .desired
            .subscriptions
            .iter()
            .map(|(subscriber, slugs)| {
                (
                    subscriber.to_string(),
                    slugs.iter().map(|s| s.to_string()).collect(),
                )
            })
            .collect();
        let filters = self
            .desired
            .filters
            .iter()
            .map(|(subscriber, filter)| {
                (
                    subscriber.to_string(),
                    filter.kinds().map(|k| k.as_str().to_string()).collect(),
                )
            })
            .collect();
        SubscriptionState {
            subscriptions,
            filters,
        }
    }

    pub fn desired(&self) -> &Desired {
        &self.desired
    }

    /// Restore desired state captured before a failed write-through.
    /// Handles of collections that are no longer active are discarded.
    pub fn restore(&mut self, desired: Desired) {
        self.desired = desired;
        let active = &self.desired.active;
        self.handles.retain(|slug, _| active.contains(slug));
    }

    pub fn has_subscriber(&self, subscriber: &SubscriberId) -> bool {
        self.desired.subscriptions.contains_key(subscriber) || self.desired.filters.contains_key(subscriber)
    }

    // =========================================================================
    // Desired state
    // =========================================================================

    /// Record a subscription. Returns `true` if the collection became active.
    ///
    /// `filter` replaces the subscriber's filter when given; otherwise a
    /// subscriber without one gets the all-kinds filter.
    pub fn subscribe(
        &mut self,
        subscriber: &SubscriberId,
        collection: &CollectionSlug,
        filter: Option<EventFilter>,
    ) -> Result<bool> {
        let held = self.desired.subscriptions.get(subscriber);
        if held.is_some_and(|slugs| slugs.contains(collection)) {
            return Err(Error::AlreadySubscribed {
                subscriber: subscriber.to_string(),
                collection: collection.to_string(),
            });
        }
        if held.map_or(0, Vec::len) >= MAX_SUBSCRIPTIONS_PER_SUBSCRIBER {
            return Err(Error::CapacityExceeded {
                subscriber: subscriber.to_string(),
                limit: MAX_SUBSCRIPTIONS_PER_SUBSCRIBER,
            });
        }

        self.desired
            .subscriptions
            .entry(subscriber.clone())
            .or_default()
            .push(collection.clone());
        match filter {
            Some(filter) => {
                self.desired.filters.insert(subscriber.clone(), filter);
            }
            None => {
                self.desired
                    .filters
                    .entry(subscriber.clone())
                    .or_insert_with(EventFilter::all);
            }
        }

        if self.desired.active.contains(collection) {
            Ok(false)
        } else {
            self.desired.active.push(collection.clone());
            Ok(true)
        }
    }

    /// Remove a subscription. Returns `true` if the collection became
    /// inactive; its handle stays until [`Self::discard_handle`].
    pub fn unsubscribe(&mut self, subscriber: &SubscriberId, collection: &CollectionSlug) -> Result<bool> {
        let slugs = self
            .desired
            .subscriptions
            .get_mut(subscriber)
            .filter(|slugs| slugs.contains(collection))
            .ok_or_else(|| Error::NotSubscribed {
                subscriber: subscriber.to_string(),
                collection: collection.to_string(),
            })?;
        slugs.retain(|slug| slug != collection);
        if slugs.is_empty() {
            self.desired.subscriptions.remove(subscriber);
        }
        Ok(self.deactivate_if_unheld(collection))
    }

    /// Remove every subscription and the filter of a subscriber. Returns the
    /// collections that became inactive.
    pub fn clear(&mut self, subscriber: &SubscriberId) -> Vec<CollectionSlug> {
        self.desired.filters.remove(subscriber);
        let slugs = self
            .desired
            .subscriptions
            .remove(subscriber)
            .unwrap_or_default();
        slugs
            .into_iter()
            .filter(|slug| self.deactivate_if_unheld(slug))
            .collect()
    }

    fn deactivate_if_unheld(&mut self, collection: &CollectionSlug) -> bool {
        let still_held = self
            .desired
            .subscriptions
            .values()
            .any(|slugs| slugs.contains(collection));
        if !still_held {
            self.desired.active.retain(|slug| slug != collection);
        }
        !still_held
    }

    /// Drop the handle of a collection that went inactive.
    pub fn discard_handle(&mut self, collection: &CollectionSlug) -> Option<TopicHandle> {
        if self.is_active(collection) {
            return None;
        }
        self.handles.remove(collection)
    }

    pub fn set_filter(&mut self, subscriber: &SubscriberId, filter: EventFilter) {
        self.desired.filters.insert(subscriber.clone(), filter);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn is_active(&self, collection: &CollectionSlug) -> bool {
        self.desired.active.contains(collection)
    }

    pub fn active_collections(&self) -> &[CollectionSlug] {
        &self.desired.active
    }

    pub fn subscriptions_of(&self, subscriber: &SubscriberId) -> &[CollectionSlug] {
        self.desired
            .subscriptions
            .get(subscriber)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn filter_of(&self, subscriber: &SubscriberId) -> Option<&EventFilter> {
        self.desired.filters.get(subscriber)
    }

    /// Subscribers holding a collection, with their filters.
    pub fn subscribers_of<'a>(
        &'a self,
        collection: &'a CollectionSlug,
    ) -> impl Iterator<Item = (&'a SubscriberId, Option<&'a EventFilter>)> + 'a {
        self.desired
            .subscriptions
            .iter()
            .filter(move |(_, slugs)| slugs.contains(collection))
            .map(move |(subscriber, _)| (subscriber, self.desired.filters.get(subscriber)))
    }

    pub fn holder_count(&self, collection: &CollectionSlug) -> usize {
        self.subscribers_of(collection).count()
    }

    pub fn handle(&self, collection: &CollectionSlug) -> Option<&TopicHandle> {
        self.handles.get(collection)
    }

    // =========================================================================
    // Issued state
    // =========================================================================

    /// Record a join issued on connection `generation`.
    pub fn record_join(&mut self, collection: &CollectionSlug, reference: u64, generation: u64) {
        self.handles.insert(
            collection.clone(),
            TopicHandle {
                reference,
                generation,
                status: AckStatus::Pending,
            },
        );
    }

    /// Apply an ack. Returns the collection whose handle it resolved; acks
    /// that match no current handle (heartbeats, leaves, stale refs) yield `None`.
    pub fn apply_ack(&mut self, reference: u64, generation: u64, ok: bool) -> Option<CollectionSlug> {
        let (slug, handle) = self
            .handles
            .iter_mut()
            .find(|(_, h)| h.reference == reference && h.generation == generation)?;
        handle.status = if ok {
            AckStatus::Confirmed
        } else {
            AckStatus::Failed
        };
        Some(slug.clone())
    }

    /// Mark a collection's topic as failed after the upstream closed it.
    /// Returns the ref of the handle that was live, if any.
    pub fn mark_closed(&mut self, collection: &CollectionSlug) -> Option<u64> {
        let handle = self.handles.get_mut(collection)?;
        let live = handle.status != AckStatus::Failed;
        handle.status = AckStatus::Failed;
        live.then_some(handle.reference)
    }

    /// Drop all handles and any unfinished reconciliation pass. Refs from a
    /// previous connection mean nothing to the upstream.
    pub fn invalidate_handles(&mut self) {
        self.handles.clear();
        self.reconcile_queue.clear();
    }

    /// Start the reconciliation pass for a new connection.
    pub fn begin_reconcile(&mut self, generation: u64) {
        self.invalidate_handles();
        self.reconcile_generation = generation;
        self.reconcile_queue = self.desired.active.iter().cloned().collect();
    }

    pub fn reconcile_pending(&self) -> bool {
        !self.reconcile_queue.is_empty()
    }

    /// Next collection the pass should join on `generation`. Skips
    /// collections that went inactive or were already joined on this
    /// connection since the pass began.
    pub fn next_reconcile(&mut self, generation: u64) -> Option<CollectionSlug> {
        if generation != self.reconcile_generation {
            self.reconcile_queue.clear();
            return None;
        }
        while let Some(slug) = self.reconcile_queue.pop_front() {
            let joined = self
                .handles
                .get(&slug)
                .is_some_and(|h| h.generation == generation);
            if self.is_active(&slug) && !joined {
                return Some(slug);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slug(s: &str) -> CollectionSlug {
        CollectionSlug::parse(s).unwrap()
    }

    fn user(s: &str) -> SubscriberId {
        SubscriberId::new(s)
    }

    #[test]
    fn test_subscribe_defaults_filter_to_all_kinds() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.subscribe(&user("u1"), &slug("cryptopunks"), None).unwrap());
        assert_eq!(registry.filter_of(&user("u1")), Some(&EventFilter::all()));
        assert_eq!(registry.active_collections(), &[slug("cryptopunks")]);
    }

    #[test]
    fn test_subscribe_without_kinds_keeps_existing_filter() {
        let mut registry = SubscriptionRegistry::new();
        let sales = EventFilter::from_kinds([EventKind::ItemSold]);
        registry.subscribe(&user("u1"), &slug("azuki"), Some(sales.clone())).unwrap();
        registry.subscribe(&user("u1"), &slug("doodles"), None).unwrap();
        assert_eq!(registry.filter_of(&user("u1")), Some(&sales));
    }

    #[test]
    fn test_fourth_subscription_exceeds_capacity() {
        let mut registry = SubscriptionRegistry::new();
        for name in ["a", "b", "c"] {
            registry.subscribe(&user("u1"), &slug(name), None).unwrap();
        }
        let before = registry.to_state();

        let result = registry.subscribe(&user("u1"), &slug("d"), None);
        assert!(matches!(result, Err(Error::CapacityExceeded { limit: 3, .. })));
        assert_eq!(registry.active_collections().len(), 3);
        assert_eq!(registry.to_state(), before);
    }

    #[test]
    fn test_duplicate_subscription_rejected() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(&user("u1"), &slug("azuki"), None).unwrap();
        assert!(matches!(
            registry.subscribe(&user("u1"), &slug("azuki"), None),
            Err(Error::AlreadySubscribed { .. })
        ));
        // Another subscriber joining an active collection does not re-activate it.
        assert!(!registry.subscribe(&user("u2"), &slug("azuki"), None).unwrap());
        assert_eq!(registry.holder_count(&slug("azuki")), 2);
    }

    #[test]
    fn test_shared_collection_stays_active() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(&user("u1"), &slug("azuki"), None).unwrap();
        registry.subscribe(&user("u2"), &slug("azuki"), None).unwrap();
        registry.record_join(&slug("azuki"), 1, 1);

        assert!(!registry.unsubscribe(&user("u1"), &slug("azuki")).unwrap());
        assert!(registry.is_active(&slug("azuki")));
        assert_eq!(registry.discard_handle(&slug("azuki")), None);
        assert!(registry.handle(&slug("azuki")).is_some());
    }

    #[test]
    fn test_last_unsubscribe_discards_handle() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(&user("u1"), &slug("azuki"), None).unwrap();
        registry.record_join(&slug("azuki"), 4, 2);

        assert!(registry.unsubscribe(&user("u1"), &slug("azuki")).unwrap());
        assert!(!registry.is_active(&slug("azuki")));
        assert_eq!(registry.discard_handle(&slug("azuki")).map(|h| h.reference), Some(4));
        assert!(registry.handle(&slug("azuki")).is_none());
        assert!(registry.subscriptions_of(&user("u1")).is_empty());

        assert!(matches!(
            registry.unsubscribe(&user("u1"), &slug("azuki")),
            Err(Error::NotSubscribed { .. })
        ));
    }

    #[test]
    fn test_clear_removes_filter_and_deactivates() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(&user("u1"), &slug("a"), None).unwrap();
        registry.subscribe(&user("u1"), &slug("b"), None).unwrap();
        registry.subscribe(&user("u2"), &slug("b"), None).unwrap();

        assert_eq!(registry.clear(&user("u1")), vec![slug("a")]);
        assert!(!registry.has_subscriber(&user("u1")));
        assert!(registry.filter_of(&user("u1")).is_none());
        assert_eq!(registry.active_collections(), &[slug("b")]);
    }

    #[test]
    fn test_reconcile_pass_in_activation_order() {
        let mut registry = SubscriptionRegistry::new();
        for name in ["c", "a", "b"] {
            registry.subscribe(&user("u1"), &slug(name), None).unwrap();
        }
        registry.record_join(&slug("a"), 9, 1);

        registry.begin_reconcile(2);
        assert!(registry.handle(&slug("a")).is_none());

        let first = registry.next_reconcile(2).unwrap();
        assert_eq!(first, slug("c"));
        registry.record_join(&first, 1, 2);

        // Joined ahead of the pass by a fresh subscribe: skipped.
        registry.record_join(&slug("a"), 2, 2);
        // Went inactive mid-pass: skipped.
        registry.unsubscribe(&user("u1"), &slug("b")).unwrap();

        assert_eq!(registry.next_reconcile(2), None);
        assert!(!registry.reconcile_pending());
    }

    #[test]
    fn test_stale_generation_does_nothing() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(&user("u1"), &slug("a"), None).unwrap();
        registry.begin_reconcile(3);
        assert_eq!(registry.next_reconcile(2), None);

        registry.record_join(&slug("a"), 5, 3);
        assert_eq!(registry.apply_ack(5, 2, true), None);
        assert_eq!(registry.apply_ack(5, 3, true), Some(slug("a")));
        assert_eq!(registry.handle(&slug("a")).unwrap().status, AckStatus::Confirmed);
    }

    #[test]
    fn test_failed_ack_and_topic_close() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(&user("u1"), &slug("a"), None).unwrap();
        registry.record_join(&slug("a"), 1, 1);
        registry.apply_ack(1, 1, false);
        assert_eq!(registry.handle(&slug("a")).unwrap().status, AckStatus::Failed);
        assert_eq!(registry.mark_closed(&slug("a")), None);

        registry.record_join(&slug("a"), 2, 1);
        assert_eq!(registry.mark_closed(&slug("a")), Some(2));
    }

    #[test]
    fn test_load_drops_malformed_entries() {
        let mut state = SubscriptionState::default();
        state.subscriptions.insert(
            "u1".into(),
            vec![
                "azuki".into(),
                "Not A Slug".into(),
                "azuki".into(),
                "b".into(),
                "c".into(),
                "d".into(),
            ],
        );
        state.subscriptions.insert("u2".into(), vec!["BAD".into()]);
        state
            .filters
            .insert("u1".into(), vec!["item-sold".into(), "teleported".into()]);
        state.filters.insert("u3".into(), vec![]);

        let registry = SubscriptionRegistry::load(state);
        assert_eq!(
            registry.subscriptions_of(&user("u1")),
            &[slug("azuki"), slug("b"), slug("c")]
        );
        assert!(registry.subscriptions_of(&user("u2")).is_empty());
        assert_eq!(
            registry.filter_of(&user("u1")),
            Some(&EventFilter::from_kinds([EventKind::ItemSold]))
        );
        let u3 = registry.filter_of(&user("u3")).unwrap();
        assert!(u3.is_empty());
        assert!(EventKind::ALL.into_iter().all(|kind| u3.matches(kind)));
        assert_eq!(registry.active_collections().len(), 3);
    }

    #[test]
    fn test_state_round_trips_through_load() {
        let mut registry = SubscriptionRegistry::new();
        registry
            .subscribe(&user("u1"), &slug("azuki"), Some(EventFilter::from_kinds([EventKind::BidReceived])))
            .unwrap();
        registry.subscribe(&user("u2"), &slug("doodles"), None).unwrap();

        let state = registry.to_state();
        assert_eq!(state.filters["u1"], vec!["bid-received".to_string()]);
        let reloaded = SubscriptionRegistry::load(state.clone());
        assert_eq!(reloaded.to_state(), state);
    }

    #[test]
    fn test_restore_keeps_live_handle() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(&user("u1"), &slug("azuki"), None).unwrap();
        registry.record_join(&slug("azuki"), 2, 1);
        let before = registry.desired().clone();

        assert!(registry.unsubscribe(&user("u1"), &slug("azuki")).unwrap());
        registry.restore(before);

        assert!(registry.is_active(&slug("azuki")));
        assert_eq!(registry.handle(&slug("azuki")).map(|h| h.reference), Some(2));
    }

    #[test]
    fn test_restore_reverts_mutation() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(&user("u1"), &slug("azuki"), None).unwrap();
        let before = registry.desired().clone();

        registry.subscribe(&user("u1"), &slug("doodles"), None).unwrap();
        registry.record_join(&slug("doodles"), 3, 1);
        registry.restore(before);

        assert_eq!(registry.active_collections(), &[slug("azuki")]);
        assert!(registry.handle(&slug("doodles")).is_none());
    }
}
