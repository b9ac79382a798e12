//! Relay core: validate, store, fan out.
//!
//! One `Relay` sits behind every gateway. All surfaces feed the same
//! validation pipeline and the same store, so an event accepted on one
//! surface is dispatchable on all of them, and duplicate submissions are
//! idempotent everywhere.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use aether_types::{Event, Filter};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::dispatch::{Subscription, SubscriptionCounters, SubscriptionRegistry};
use crate::error::{StorageError, ValidationError};
use crate::limits::RateLimits;
use crate::metrics::RelayMetrics;
use crate::store::{EventStore, PutOutcome};
use crate::validation::{self, validate_event};

/// Origin label for events ingested from the mesh forward hook; such
/// events are not offered back to the mesh.
pub const MESH_ORIGIN: &str = "mesh";

/// How a publish was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishStatus {
    /// Stored (or ephemeral) and fanned out.
    Accepted,
    /// Already known or lost the conflict rule; acknowledged, not
    /// dispatched.
    Duplicate,
    /// Displaced a replaceable incumbent and fanned out.
    Replaced(aether_types::EventId),
}

impl PublishStatus {
    /// Stable label for HTTP responses.
    pub fn label(&self) -> &'static str {
        match self {
            PublishStatus::Accepted => "inserted",
            PublishStatus::Duplicate => "duplicate",
            PublishStatus::Replaced(_) => "replaced",
        }
    }

    /// Reason string for ACK frames, when one applies.
    pub fn ack_reason(&self) -> Option<&'static str> {
        match self {
            PublishStatus::Duplicate => Some("duplicate"),
            _ => None,
        }
    }
}

/// Publish failures, split so gateways can shape responses per §7.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The event failed validation; negative ACK with the code.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The store failed; surfaced as `internal_error`.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PublishError {
    /// The stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            PublishError::Validation(e) => e.code(),
            PublishError::Storage(_) => "internal_error",
        }
    }
}

/// The relay core shared by all gateways.
pub struct Relay {
    config: Config,
    store: Arc<dyn EventStore>,
    registry: SubscriptionRegistry,
    limits: RateLimits,
    metrics: RelayMetrics,
    forward: Option<mpsc::Sender<Event>>,
}

impl Relay {
    /// Assemble a relay from its parts.
    pub fn new(config: Config, store: Arc<dyn EventStore>) -> Self {
        let limits = RateLimits::new(&config.validation);
        let registry = SubscriptionRegistry::new(config.dispatch.outbox_capacity);
        Self {
            config,
            store,
            registry,
            limits,
            metrics: RelayMetrics::default(),
            forward: None,
        }
    }

    /// Install the mesh forward hook. Accepted events are offered to the
    /// channel best-effort; the overlay consuming it is external.
    pub fn with_forward_hook(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.forward = Some(tx);
        self
    }

    /// The relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The storage backend.
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// The subscription registry.
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Operational counters.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Validate, store, and fan out one inbound event.
    ///
    /// `origin` names the ingress connection; events arriving from the
    /// mesh hook are not forwarded back to it.
    pub async fn publish(
        &self,
        origin: &str,
        event: &Event,
    ) -> Result<PublishStatus, PublishError> {
        if let Err(err) = validate_event(
            event,
            &self.config.validation,
            &self.limits,
            validation::now_ns(),
        ) {
            self.metrics.events_rejected.fetch_add(1, Ordering::Relaxed);
            if err == ValidationError::RateLimited {
                self.metrics.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            }
            return Err(err.into());
        }

        let outcome = self.store.put(event).await?;

        let status = match outcome {
            PutOutcome::Inserted => {
                self.metrics.events_accepted.fetch_add(1, Ordering::Relaxed);
                PublishStatus::Accepted
            }
            PutOutcome::Duplicate => {
                self.metrics.events_duplicate.fetch_add(1, Ordering::Relaxed);
                return Ok(PublishStatus::Duplicate);
            }
            PutOutcome::Replaced(old_id) => {
                self.metrics.events_accepted.fetch_add(1, Ordering::Relaxed);
                self.metrics.events_replaced.fetch_add(1, Ordering::Relaxed);
                PublishStatus::Replaced(old_id)
            }
        };

        let matched = self.registry.dispatch(event);
        tracing::debug!(
            event_id = %event.event_id,
            kind = event.kind,
            matched,
            "event accepted"
        );

        if origin != MESH_ORIGIN {
            if let Some(forward) = &self.forward {
                if forward.try_send(event.clone()).is_err() {
                    tracing::debug!("mesh forward channel full, skipping");
                }
            }
        }

        Ok(status)
    }

    /// Historical backfill for a set of filters: the union of per-filter
    /// query results, deduplicated, newest-first.
    pub async fn backfill(&self, filters: &[Filter]) -> Result<Vec<Event>, StorageError> {
        let mut seen = std::collections::HashSet::new();
        let mut merged = Vec::new();
        for filter in filters {
            for event in self.store.query(filter).await? {
                if seen.insert(event.event_id) {
                    merged.push(event);
                }
            }
        }
        merged.sort_by(|a, b| (b.created_at, b.event_id).cmp(&(a.created_at, a.event_id)));
        Ok(merged)
    }

    /// Register a live subscription.
    pub fn subscribe(
        &self,
        conn_id: &str,
        sub_id: &str,
        filters: Vec<Filter>,
    ) -> Arc<Subscription> {
        self.registry.add(conn_id, sub_id, filters)
    }

    /// Close one subscription. Returns whether it existed.
    pub fn unsubscribe(&self, conn_id: &str, sub_id: &str) -> bool {
        self.registry.remove(conn_id, sub_id)
    }

    /// Revoke everything a closing connection owned.
    pub fn disconnect(&self, conn_id: &str) {
        self.registry.clear_connection(conn_id);
    }

    /// Per-subscription delivery counters.
    pub fn subscription_counters(&self) -> Vec<SubscriptionCounters> {
        self.registry.counters()
    }
}
