//! Fan-out: live subscriptions, bounded outboxes, sender tasks.
//!
//! Each subscription owns a bounded outbox with a drop-oldest policy:
//! when the queue is full the oldest pending event is discarded before
//! the new one is enqueued, so a slow consumer sees the freshest window
//! of events instead of an ever-staler backlog. The dispatcher never
//! blocks on a full outbox.
//!
//! Delivery ordering: one sender drains each outbox in FIFO order, so a
//! subscription sees events in dispatcher-observation order. There is no
//! ordering across subscriptions.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use aether_types::{Event, Filter};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;

/// A bounded event queue with drop-oldest overflow and counters.
pub struct Outbox {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    /// Events handed to the transport.
    pub delivered: AtomicU64,
    /// Events discarded because the queue was full.
    pub dropped: AtomicU64,
    /// Highest queue depth observed.
    pub queue_high_water: AtomicU64,
}

impl Outbox {
    /// Create an outbox bounded to `capacity` pending events.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            queue_high_water: AtomicU64::new(0),
        }
    }

    /// Enqueue an event, dropping the oldest pending one on overflow.
    /// Never blocks.
    pub fn push(&self, event: Event) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.queue.lock().expect("outbox lock poisoned");
            if queue.len() == self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
            let depth = queue.len() as u64;
            self.queue_high_water.fetch_max(depth, Ordering::Relaxed);
        }
        self.notify.notify_one();
    }

    /// Dequeue the next event, waiting until one arrives. Returns `None`
    /// once the outbox is closed and drained.
    pub async fn pop(&self) -> Option<Event> {
        loop {
            {
                let mut queue = self.queue.lock().expect("outbox lock poisoned");
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Close the outbox; pending events remain poppable, waiters wake.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Current queue depth.
    pub fn depth(&self) -> usize {
        self.queue.lock().expect("outbox lock poisoned").len()
    }
}

/// A live subscription: a connection-local id, its filters, and an outbox.
pub struct Subscription {
    /// Owning connection.
    pub conn_id: String,
    /// Connection-local subscription id.
    pub sub_id: String,
    /// Filters; matching any one delivers the event.
    pub filters: Vec<Filter>,
    /// Bounded outbound queue.
    pub outbox: Outbox,
}

impl Subscription {
    /// Authoritative match against this subscription's filters.
    pub fn matches(&self, event: &Event) -> bool {
        self.filters.iter().any(|f| f.matches(event))
    }
}

type SubKey = (String, String);

/// The live subscription registry plus the inverted kind index used to
/// prune dispatch candidates.
///
/// Subscriptions whose every filter names kinds are indexed per kind;
/// the rest land in a wildcard set. Candidate selection is a union of
/// the event's kind bucket and the wildcard set; the authoritative
/// filter match runs on each candidate.
pub struct SubscriptionRegistry {
    subs: DashMap<SubKey, Arc<Subscription>>,
    by_connection: DashMap<String, HashSet<String>>,
    by_kind: DashMap<u16, HashSet<SubKey>>,
    wildcard: DashMap<SubKey, ()>,
    outbox_capacity: usize,
}

impl SubscriptionRegistry {
    /// Create a registry whose outboxes hold `outbox_capacity` events.
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            subs: DashMap::new(),
            by_connection: DashMap::new(),
            by_kind: DashMap::new(),
            wildcard: DashMap::new(),
            outbox_capacity,
        }
    }

    /// Register a subscription, replacing any prior one with the same id
    /// on the same connection.
    pub fn add(
        &self,
        conn_id: &str,
        sub_id: &str,
        filters: Vec<Filter>,
    ) -> Arc<Subscription> {
        self.remove(conn_id, sub_id);

        let key: SubKey = (conn_id.to_string(), sub_id.to_string());
        let subscription = Arc::new(Subscription {
            conn_id: conn_id.to_string(),
            sub_id: sub_id.to_string(),
            filters,
            outbox: Outbox::new(self.outbox_capacity),
        });

        let mut indexed_kinds: HashSet<u16> = HashSet::new();
        let mut wildcard = false;
        for filter in &subscription.filters {
            match &filter.kinds {
                Some(kinds) => indexed_kinds.extend(kinds.iter().copied()),
                None => wildcard = true,
            }
        }
        if subscription.filters.is_empty() {
            wildcard = true;
        }
        for kind in indexed_kinds {
            self.by_kind.entry(kind).or_default().insert(key.clone());
        }
        if wildcard {
            self.wildcard.insert(key.clone(), ());
        }

        self.by_connection
            .entry(conn_id.to_string())
            .or_default()
            .insert(sub_id.to_string());
        self.subs.insert(key, subscription.clone());
        subscription
    }

    /// Remove one subscription, closing its outbox. Returns whether it
    /// existed.
    pub fn remove(&self, conn_id: &str, sub_id: &str) -> bool {
        let key: SubKey = (conn_id.to_string(), sub_id.to_string());
        let Some((_, subscription)) = self.subs.remove(&key) else {
            return false;
        };
        subscription.outbox.close();
        self.unindex(&key, &subscription);
        if let Some(mut subs) = self.by_connection.get_mut(conn_id) {
            subs.remove(sub_id);
            if subs.is_empty() {
                drop(subs);
                self.by_connection.remove(conn_id);
            }
        }
        true
    }

    /// Revoke every subscription owned by a connection.
    pub fn clear_connection(&self, conn_id: &str) {
        let Some((_, sub_ids)) = self.by_connection.remove(conn_id) else {
            return;
        };
        for sub_id in sub_ids {
            let key: SubKey = (conn_id.to_string(), sub_id);
            if let Some((_, subscription)) = self.subs.remove(&key) {
                subscription.outbox.close();
                self.unindex(&key, &subscription);
            }
        }
    }

    fn unindex(&self, key: &SubKey, subscription: &Subscription) {
        for filter in &subscription.filters {
            if let Some(kinds) = &filter.kinds {
                for kind in kinds {
                    if let Some(mut set) = self.by_kind.get_mut(kind) {
                        set.remove(key);
                        if set.is_empty() {
                            drop(set);
                            self.by_kind.remove(kind);
                        }
                    }
                }
            }
        }
        self.wildcard.remove(key);
    }

    /// Fan an accepted event out to every matching subscription's outbox.
    /// Returns the number of subscriptions matched.
    pub fn dispatch(&self, event: &Event) -> usize {
        let mut candidates: HashSet<SubKey> = HashSet::new();
        if let Some(keys) = self.by_kind.get(&event.kind) {
            candidates.extend(keys.iter().cloned());
        }
        for entry in self.wildcard.iter() {
            candidates.insert(entry.key().clone());
        }

        let mut matched = 0;
        for key in candidates {
            if let Some(subscription) = self.subs.get(&key) {
                if subscription.matches(event) {
                    subscription.outbox.push(event.clone());
                    matched += 1;
                }
            }
        }
        matched
    }

    /// Look up one subscription.
    pub fn get(&self, conn_id: &str, sub_id: &str) -> Option<Arc<Subscription>> {
        self.subs
            .get(&(conn_id.to_string(), sub_id.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Total live subscriptions.
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    /// Whether no subscriptions are live.
    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Per-subscription delivery counters, for health reporting.
    pub fn counters(&self) -> Vec<SubscriptionCounters> {
        self.subs
            .iter()
            .map(|entry| {
                let sub = entry.value();
                SubscriptionCounters {
                    conn_id: sub.conn_id.clone(),
                    sub_id: sub.sub_id.clone(),
                    delivered: sub.outbox.delivered.load(Ordering::Relaxed),
                    dropped: sub.outbox.dropped.load(Ordering::Relaxed),
                    queue_high_water: sub.outbox.queue_high_water.load(Ordering::Relaxed),
                }
            })
            .collect()
    }
}

/// Delivery counters for one subscription.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubscriptionCounters {
    /// Owning connection.
    pub conn_id: String,
    /// Subscription id.
    pub sub_id: String,
    /// Events handed to the transport.
    pub delivered: u64,
    /// Events discarded by the drop-oldest policy.
    pub dropped: u64,
    /// Highest observed queue depth.
    pub queue_high_water: u64,
}

/// A connection's outbound half, as seen by subscription senders.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event for a subscription. Returns false when the
    /// connection is gone and the sender should stop.
    async fn deliver(&self, sub_id: &str, event: &Event) -> bool;
}

/// Spawn the dedicated sender that drains a subscription's outbox to its
/// connection in FIFO order. At most one sender runs per subscription.
pub fn spawn_sender(
    subscription: Arc<Subscription>,
    sink: Arc<dyn EventSink>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = subscription.outbox.pop().await {
            if !sink.deliver(&subscription.sub_id, &event).await {
                subscription.outbox.close();
                break;
            }
            subscription.outbox.delivered.fetch_add(1, Ordering::Relaxed);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aether_types::Event;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn event(kind: u16, created_at: u64) -> Event {
        Event::signed(&[1u8; 32], kind, created_at, vec![], "")
    }

    fn filter(raw: serde_json::Value) -> Filter {
        Filter::from_value(&raw).unwrap()
    }

    #[test]
    fn outbox_drop_oldest_keeps_latest_window() {
        let outbox = Outbox::new(4);
        for i in 0..10 {
            outbox.push(event(29_999, i));
        }
        assert_eq!(outbox.depth(), 4);
        assert_eq!(outbox.dropped.load(Ordering::Relaxed), 6);

        // the four latest survive, in FIFO order
        let mut remaining = Vec::new();
        {
            let mut queue = outbox.queue.lock().unwrap();
            while let Some(ev) = queue.pop_front() {
                remaining.push(ev.created_at);
            }
        }
        assert_eq!(remaining, vec![6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn outbox_pop_returns_none_after_close_and_drain() {
        let outbox = Outbox::new(4);
        outbox.push(event(1, 1));
        outbox.close();
        assert!(outbox.pop().await.is_some());
        assert!(outbox.pop().await.is_none());
    }

    #[tokio::test]
    async fn outbox_push_after_close_is_ignored() {
        let outbox = Outbox::new(4);
        outbox.close();
        outbox.push(event(1, 1));
        assert_eq!(outbox.depth(), 0);
    }

    #[test]
    fn registry_dispatch_matches_kind_index() {
        let registry = SubscriptionRegistry::new(16);
        registry.add("conn-1", "sub-1", vec![filter(json!({"kinds": [1]}))]);
        registry.add("conn-2", "sub-2", vec![filter(json!({"kinds": [2]}))]);

        assert_eq!(registry.dispatch(&event(1, 10)), 1);
        let sub = registry.get("conn-1", "sub-1").unwrap();
        assert_eq!(sub.outbox.depth(), 1);
        let other = registry.get("conn-2", "sub-2").unwrap();
        assert_eq!(other.outbox.depth(), 0);
    }

    #[test]
    fn registry_wildcard_subscriptions_see_all_kinds() {
        let registry = SubscriptionRegistry::new(16);
        registry.add("conn-1", "all", vec![filter(json!({"since": 0}))]);
        assert_eq!(registry.dispatch(&event(1, 10)), 1);
        assert_eq!(registry.dispatch(&event(29_999, 10)), 1);
    }

    #[test]
    fn registry_remove_stops_dispatch() {
        let registry = SubscriptionRegistry::new(16);
        registry.add("conn-1", "sub-1", vec![filter(json!({"kinds": [1]}))]);
        assert!(registry.remove("conn-1", "sub-1"));
        assert!(!registry.remove("conn-1", "sub-1"));
        assert_eq!(registry.dispatch(&event(1, 10)), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn registry_clear_connection_revokes_all() {
        let registry = SubscriptionRegistry::new(16);
        registry.add("conn-1", "a", vec![filter(json!({"kinds": [1]}))]);
        registry.add("conn-1", "b", vec![filter(json!({"kinds": [2]}))]);
        registry.add("conn-2", "c", vec![filter(json!({"kinds": [1]}))]);
        registry.clear_connection("conn-1");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.dispatch(&event(1, 10)), 1);
    }

    #[test]
    fn re_adding_a_sub_id_replaces_the_old_subscription() {
        let registry = SubscriptionRegistry::new(16);
        let old = registry.add("conn-1", "sub", vec![filter(json!({"kinds": [1]}))]);
        registry.add("conn-1", "sub", vec![filter(json!({"kinds": [2]}))]);
        assert_eq!(registry.len(), 1);
        // old outbox was closed, new filter is live
        assert_eq!(registry.dispatch(&event(1, 10)), 0);
        assert_eq!(registry.dispatch(&event(2, 10)), 1);
        assert_eq!(old.outbox.depth(), 0);
    }

    struct RecordingSink {
        seen: StdMutex<Vec<u64>>,
        alive: AtomicBool,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn deliver(&self, _sub_id: &str, event: &Event) -> bool {
            if !self.alive.load(Ordering::Relaxed) {
                return false;
            }
            self.seen.lock().unwrap().push(event.created_at);
            true
        }
    }

    #[tokio::test]
    async fn sender_drains_fifo_and_counts_delivered() {
        let registry = SubscriptionRegistry::new(16);
        let sub = registry.add("conn-1", "sub", vec![filter(json!({"kinds": [1]}))]);
        let sink = Arc::new(RecordingSink {
            seen: StdMutex::new(Vec::new()),
            alive: AtomicBool::new(true),
        });
        let handle = spawn_sender(sub.clone(), sink.clone());

        for i in 0..5 {
            registry.dispatch(&event(1, i));
        }
        // close after the queue drains so the sender exits
        while sub.outbox.depth() > 0 {
            tokio::task::yield_now().await;
        }
        sub.outbox.close();
        handle.await.unwrap();

        assert_eq!(*sink.seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(sub.outbox.delivered.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn sender_stops_when_sink_reports_gone() {
        let registry = SubscriptionRegistry::new(16);
        let sub = registry.add("conn-1", "sub", vec![filter(json!({"kinds": [1]}))]);
        let sink = Arc::new(RecordingSink {
            seen: StdMutex::new(Vec::new()),
            alive: AtomicBool::new(false),
        });
        let handle = spawn_sender(sub.clone(), sink);
        registry.dispatch(&event(1, 1));
        handle.await.unwrap();
        assert_eq!(sub.outbox.delivered.load(Ordering::Relaxed), 0);
    }
}
