//! Background garbage collection for immutable events.
//!
//! Runs on the configured cadence and drops immutable events older than
//! the TTL. The replaceable classes are constant per key and ephemeral
//! events were never stored, so neither needs collecting.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;

use crate::config::CleanupConfig;
use crate::store::EventStore;
use crate::validation::now_ns;

/// Spawn the GC task. Returns a handle that can be aborted at shutdown.
pub fn spawn_gc_task(
    store: Arc<dyn EventStore>,
    config: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("gc task disabled");
            return;
        }
        let Some(ttl_secs) = config.immutable_ttl_secs else {
            tracing::info!("no immutable TTL configured, gc task idle");
            return;
        };
        let ttl_ns = ttl_secs.saturating_mul(1_000_000_000);
        tracing::info!(interval_secs = config.interval_secs, ttl_secs, "gc task started");

        let mut timer = interval(Duration::from_secs(config.interval_secs));
        loop {
            timer.tick().await;
            match store.gc(now_ns(), ttl_ns).await {
                Ok(0) => tracing::debug!("gc: nothing expired"),
                Ok(dropped) => tracing::info!(dropped, "gc: dropped expired events"),
                Err(err) => tracing::error!("gc failed: {err}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use aether_types::Event;

    #[tokio::test]
    async fn disabled_task_exits_immediately() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryStore::new());
        let config = CleanupConfig {
            enabled: false,
            interval_secs: 1,
            immutable_ttl_secs: Some(1),
        };
        let handle = spawn_gc_task(store, config);
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("task should exit when disabled")
            .expect("task should not panic");
    }

    #[tokio::test]
    async fn task_without_ttl_exits_immediately() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryStore::new());
        let config = CleanupConfig {
            enabled: true,
            interval_secs: 1,
            immutable_ttl_secs: None,
        };
        let handle = spawn_gc_task(store, config);
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("task should exit without a TTL")
            .expect("task should not panic");
    }

    #[tokio::test]
    async fn gc_pass_drops_expired_events() {
        let store = Arc::new(MemoryStore::new());
        // created_at far in the past
        let stale = Event::signed(&[1; 32], 1, 1, vec![], "old");
        store.put(&stale).await.unwrap();
        let dropped = store.gc(now_ns(), 1_000_000_000).await.unwrap();
        assert_eq!(dropped, 1);
        assert_eq!(store.len().await.unwrap(), 0);
    }
}
