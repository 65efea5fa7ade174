//! Pending subscribe acknowledgements keyed by join ref.
//!
//! Every waiter is resolved exactly once: by the matching reply, by its
//! deadline, or when the connection or the client goes away.

use common::error::{Error, Result};
use common::{CollectionSlug, SubscribeOutcome};
use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;

type Reply = oneshot::Sender<Result<SubscribeOutcome>>;

struct Waiter {
    deadline: Instant,
    reply: Reply,
}

struct Entry {
    collection: CollectionSlug,
    waiters: Vec<Waiter>,
}

#[derive(Default)]
pub struct PendingAcks {
    entries: HashMap<u64, Entry>,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the reply to join `reference`. Several callers may wait on
    /// the same join when they subscribe to the same collection.
    pub fn wait(&mut self, reference: u64, collection: CollectionSlug, deadline: Instant, reply: Reply) {
        self.entries
            .entry(reference)
            .or_insert_with(|| Entry {
                collection,
                waiters: Vec::new(),
            })
            .waiters
            .push(Waiter { deadline, reply });
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(|e| e.waiters.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve every waiter on `reference`. Returns how many were waiting.
    pub fn resolve(
        &mut self,
        reference: u64,
        outcome: impl Fn(&CollectionSlug) -> Result<SubscribeOutcome>,
    ) -> usize {
        let Some(entry) = self.entries.remove(&reference) else {
            return 0;
        };
        let count = entry.waiters.len();
        for waiter in entry.waiters {
            let _ = waiter.reply.send(outcome(&entry.collection));
        }
        count
    }

    /// Resolve every waiter.
    pub fn resolve_all(&mut self, outcome: impl Fn(&CollectionSlug) -> Result<SubscribeOutcome>) -> usize {
        let references: Vec<u64> = self.entries.keys().copied().collect();
        references
            .into_iter()
            .map(|reference| self.resolve(reference, &outcome))
            .sum()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .values()
            .flat_map(|entry| entry.waiters.iter().map(|w| w.deadline))
            .min()
    }

    /// Answer `AckTimeout` to every waiter whose deadline has passed.
    /// Returns the collections that timed out.
    pub fn expire(&mut self, now: Instant) -> Vec<CollectionSlug> {
        let mut expired = Vec::new();
        self.entries.retain(|_, entry| {
            let (due, waiting): (Vec<Waiter>, Vec<Waiter>) =
                entry.waiters.drain(..).partition(|w| w.deadline <= now);
            for waiter in due {
                let _ = waiter
                    .reply
                    .send(Err(Error::AckTimeout(entry.collection.to_string())));
                expired.push(entry.collection.clone());
            }
            entry.waiters = waiting;
            !entry.waiters.is_empty()
        });
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn slug(s: &str) -> CollectionSlug {
        CollectionSlug::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_resolve_answers_all_waiters_once() {
        let mut pending = PendingAcks::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        pending.wait(3, slug("azuki"), deadline, tx1);
        pending.wait(3, slug("azuki"), deadline, tx2);
        assert_eq!(pending.len(), 2);

        assert_eq!(pending.resolve(3, |_| Ok(SubscribeOutcome::Confirmed)), 2);
        assert_eq!(pending.resolve(3, |_| Ok(SubscribeOutcome::Confirmed)), 0);
        assert!(pending.is_empty());
        assert_eq!(rx1.await.unwrap().unwrap(), SubscribeOutcome::Confirmed);
        assert_eq!(rx2.await.unwrap().unwrap(), SubscribeOutcome::Confirmed);
    }

    #[tokio::test]
    async fn test_expire_only_due_waiters() {
        let mut pending = PendingAcks::new();
        let now = Instant::now();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        pending.wait(1, slug("azuki"), now + Duration::from_secs(1), tx1);
        pending.wait(2, slug("doodles"), now + Duration::from_secs(5), tx2);
        assert_eq!(pending.next_deadline(), Some(now + Duration::from_secs(1)));

        assert_eq!(pending.expire(now + Duration::from_secs(1)), vec![slug("azuki")]);
        assert!(matches!(rx1.await.unwrap(), Err(Error::AckTimeout(c)) if c == "azuki"));
        assert!(rx2.try_recv().is_err());
        assert_eq!(pending.next_deadline(), Some(now + Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_resolve_all_cancels() {
        let mut pending = PendingAcks::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let (tx, rx) = oneshot::channel();
        pending.wait(7, slug("azuki"), deadline, tx);

        assert_eq!(pending.resolve_all(|_| Err(Error::Cancelled)), 1);
        assert!(matches!(rx.await.unwrap(), Err(Error::Cancelled)));
        assert_eq!(pending.next_deadline(), None);
    }
}
