//! In-memory storage backend.
//!
//! A single `RwLock` over the maps makes every `put` linearizable; no
//! await points while the lock is held.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use aether_types::{Event, EventId, Filter, Pubkey, StorageClass};
use async_trait::async_trait;

use super::{order_backfill, replacement_wins, EventStore, PutOutcome};
use crate::error::StorageError;

/// In-memory event store with filter-lookup indexes.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<EventId, Event>,
    replaceable: HashMap<(Pubkey, u16), EventId>,
    parameterized: HashMap<(Pubkey, u16, String), EventId>,
    by_kind: HashMap<u16, HashSet<EventId>>,
    by_pubkey: HashMap<Pubkey, HashSet<EventId>>,
    by_tag: HashMap<(String, String), HashSet<EventId>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn add(&mut self, event: &Event) {
        let id = event.event_id;
        self.by_kind.entry(event.kind).or_default().insert(id);
        self.by_pubkey.entry(event.pubkey).or_default().insert(id);
        for tag in &event.tags {
            for value in &tag.values {
                self.by_tag
                    .entry((tag.key.clone(), value.clone()))
                    .or_default()
                    .insert(id);
            }
        }
        self.by_id.insert(id, event.clone());
    }

    fn remove(&mut self, id: &EventId) {
        let Some(event) = self.by_id.remove(id) else {
            return;
        };
        if let Some(set) = self.by_kind.get_mut(&event.kind) {
            set.remove(id);
            if set.is_empty() {
                self.by_kind.remove(&event.kind);
            }
        }
        if let Some(set) = self.by_pubkey.get_mut(&event.pubkey) {
            set.remove(id);
            if set.is_empty() {
                self.by_pubkey.remove(&event.pubkey);
            }
        }
        for tag in &event.tags {
            for value in &tag.values {
                let key = (tag.key.clone(), value.clone());
                if let Some(set) = self.by_tag.get_mut(&key) {
                    set.remove(id);
                    if set.is_empty() {
                        self.by_tag.remove(&key);
                    }
                }
            }
        }
    }

    // Index-driven candidate selection; None means no selective predicate
    // was present and the whole table is scanned.
    fn candidates(&self, filter: &Filter) -> Option<HashSet<EventId>> {
        let mut candidates: Option<HashSet<EventId>> = None;

        if let Some(kinds) = &filter.kinds {
            let mut ids = HashSet::new();
            for kind in kinds {
                if let Some(set) = self.by_kind.get(kind) {
                    ids.extend(set.iter().copied());
                }
            }
            candidates = Some(ids);
        }

        if let Some(prefixes) = &filter.pubkey_prefixes {
            let mut ids = HashSet::new();
            for (pubkey, set) in &self.by_pubkey {
                if prefixes.iter().any(|p| pubkey.starts_with(p)) {
                    ids.extend(set.iter().copied());
                }
            }
            candidates = Some(match candidates {
                Some(existing) => existing.intersection(&ids).copied().collect(),
                None => ids,
            });
        }

        if let Some(required) = &filter.tags {
            for (key, values) in required {
                let mut ids = HashSet::new();
                for value in values {
                    if let Some(set) = self.by_tag.get(&(key.clone(), value.clone())) {
                        ids.extend(set.iter().copied());
                    }
                }
                candidates = Some(match candidates {
                    Some(existing) => existing.intersection(&ids).copied().collect(),
                    None => ids,
                });
            }
        }

        candidates
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn put(&self, event: &Event) -> Result<PutOutcome, StorageError> {
        let class = StorageClass::of(event.kind)
            .ok_or(StorageError::UnsupportedKind(event.kind))?;

        if class == StorageClass::Ephemeral {
            return Ok(PutOutcome::Inserted);
        }

        let mut inner = self.inner.write().expect("store lock poisoned");

        if inner.by_id.contains_key(&event.event_id) {
            return Ok(PutOutcome::Duplicate);
        }

        match class {
            StorageClass::Immutable => {
                inner.add(event);
                Ok(PutOutcome::Inserted)
            }
            StorageClass::Replaceable => {
                let key = (event.pubkey, event.kind);
                match inner.replaceable.get(&key).copied() {
                    Some(old_id) => {
                        let old_created = inner.by_id[&old_id].created_at;
                        if replacement_wins(
                            event.created_at,
                            &event.event_id,
                            old_created,
                            &old_id,
                        ) {
                            inner.remove(&old_id);
                            inner.add(event);
                            inner.replaceable.insert(key, event.event_id);
                            Ok(PutOutcome::Replaced(old_id))
                        } else {
                            Ok(PutOutcome::Duplicate)
                        }
                    }
                    None => {
                        inner.add(event);
                        inner.replaceable.insert(key, event.event_id);
                        Ok(PutOutcome::Inserted)
                    }
                }
            }
            StorageClass::ParameterizedReplaceable => {
                let key = (event.pubkey, event.kind, event.d_value().to_string());
                match inner.parameterized.get(&key).copied() {
                    Some(old_id) => {
                        let old_created = inner.by_id[&old_id].created_at;
                        if replacement_wins(
                            event.created_at,
                            &event.event_id,
                            old_created,
                            &old_id,
                        ) {
                            inner.remove(&old_id);
                            inner.add(event);
                            inner.parameterized.insert(key, event.event_id);
                            Ok(PutOutcome::Replaced(old_id))
                        } else {
                            Ok(PutOutcome::Duplicate)
                        }
                    }
                    None => {
                        inner.add(event);
                        inner.parameterized.insert(key, event.event_id);
                        Ok(PutOutcome::Inserted)
                    }
                }
            }
            StorageClass::Ephemeral => unreachable!("handled above"),
        }
    }

    async fn query(&self, filter: &Filter) -> Result<Vec<Event>, StorageError> {
        let inner = self.inner.read().expect("store lock poisoned");
        let matched: Vec<Event> = match inner.candidates(filter) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| inner.by_id.get(id))
                .filter(|ev| filter.matches(ev))
                .cloned()
                .collect(),
            None => inner
                .by_id
                .values()
                .filter(|ev| filter.matches(ev))
                .cloned()
                .collect(),
        };
        Ok(order_backfill(matched, filter.limit))
    }

    async fn gc(&self, now_ns: u64, ttl_ns: u64) -> Result<u64, StorageError> {
        let cutoff = now_ns.saturating_sub(ttl_ns);
        let mut inner = self.inner.write().expect("store lock poisoned");
        let expired: Vec<EventId> = inner
            .by_id
            .values()
            .filter(|ev| {
                ev.storage_class() == Some(StorageClass::Immutable) && ev.created_at < cutoff
            })
            .map(|ev| ev.event_id)
            .collect();
        for id in &expired {
            inner.remove(id);
        }
        Ok(expired.len() as u64)
    }

    async fn len(&self) -> Result<u64, StorageError> {
        Ok(self.inner.read().expect("store lock poisoned").by_id.len() as u64)
    }
}
