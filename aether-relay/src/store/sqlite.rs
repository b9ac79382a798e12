//! SQLite storage backend.
//!
//! Uses WAL mode for concurrent reads alongside the single writer.
//! Replacement is delete-then-insert inside one transaction, so after a
//! crash either the pre-write or post-write state is visible, never a
//! torn event.

use std::path::Path;
use std::str::FromStr;

use aether_types::{Event, EventId, Filter, Pubkey, Sig, StorageClass, Tag};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use super::{order_backfill, replacement_wins, EventStore, PutOutcome};
use crate::error::StorageError;

/// SQLite-backed event store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) a store at the given path.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(&path.to_string_lossy())
            .map_err(StorageError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// An in-memory SQLite store, for tests.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(":memory:")
            .map_err(StorageError::Database)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                event_id BLOB PRIMARY KEY,
                pubkey BLOB NOT NULL,
                kind INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                d_value TEXT NOT NULL,
                tags TEXT NOT NULL,
                content BLOB NOT NULL,
                sig BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS event_tags (
                event_id BLOB NOT NULL,
                tag_key TEXT NOT NULL,
                tag_value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS events_pubkey_kind_idx ON events(pubkey, kind)",
            "CREATE INDEX IF NOT EXISTS events_pubkey_kind_d_idx ON events(pubkey, kind, d_value)",
            "CREATE INDEX IF NOT EXISTS events_kind_created_idx ON events(kind, created_at DESC)",
            "CREATE INDEX IF NOT EXISTS events_created_idx ON events(created_at DESC)",
            "CREATE INDEX IF NOT EXISTS event_tags_kv_idx ON event_tags(tag_key, tag_value)",
            "CREATE INDEX IF NOT EXISTS event_tags_event_idx ON event_tags(event_id)",
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(StorageError::Database)?;
        }

        Ok(())
    }

    async fn insert_event(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        event: &Event,
    ) -> Result<(), StorageError> {
        let tags_json =
            serde_json::to_string(&event.tags).map_err(|e| StorageError::Corrupt {
                reason: e.to_string(),
            })?;
        sqlx::query(
            r#"
            INSERT INTO events (event_id, pubkey, kind, created_at, d_value, tags, content, sig)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(event.event_id.as_bytes().as_slice())
        .bind(event.pubkey.as_bytes().as_slice())
        .bind(event.kind as i64)
        .bind(event.created_at as i64)
        .bind(event.d_value())
        .bind(tags_json)
        .bind(event.content.as_bytes())
        .bind(event.sig.as_bytes().as_slice())
        .execute(&mut **tx)
        .await
        .map_err(StorageError::Database)?;

        for tag in &event.tags {
            for value in &tag.values {
                sqlx::query(
                    "INSERT INTO event_tags (event_id, tag_key, tag_value) VALUES (?1, ?2, ?3)",
                )
                .bind(event.event_id.as_bytes().as_slice())
                .bind(&tag.key)
                .bind(value)
                .execute(&mut **tx)
                .await
                .map_err(StorageError::Database)?;
            }
        }
        Ok(())
    }

    async fn delete_event(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        event_id: &[u8],
    ) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM event_tags WHERE event_id = ?1")
            .bind(event_id)
            .execute(&mut **tx)
            .await
            .map_err(StorageError::Database)?;
        sqlx::query("DELETE FROM events WHERE event_id = ?1")
            .bind(event_id)
            .execute(&mut **tx)
            .await
            .map_err(StorageError::Database)?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn put(&self, event: &Event) -> Result<PutOutcome, StorageError> {
        let class = StorageClass::of(event.kind)
            .ok_or(StorageError::UnsupportedKind(event.kind))?;

        if class == StorageClass::Ephemeral {
            return Ok(PutOutcome::Inserted);
        }

        let mut tx = self.pool.begin().await.map_err(StorageError::Database)?;

        let exists: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM events WHERE event_id = ?1")
                .bind(event.event_id.as_bytes().as_slice())
                .fetch_optional(&mut *tx)
                .await
                .map_err(StorageError::Database)?;
        if exists.is_some() {
            return Ok(PutOutcome::Duplicate);
        }

        let incumbent: Option<(Vec<u8>, i64)> = match class {
            StorageClass::Immutable => None,
            StorageClass::Replaceable => sqlx::query_as(
                "SELECT event_id, created_at FROM events WHERE pubkey = ?1 AND kind = ?2",
            )
            .bind(event.pubkey.as_bytes().as_slice())
            .bind(event.kind as i64)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StorageError::Database)?,
            StorageClass::ParameterizedReplaceable => sqlx::query_as(
                "SELECT event_id, created_at FROM events \
                 WHERE pubkey = ?1 AND kind = ?2 AND d_value = ?3",
            )
            .bind(event.pubkey.as_bytes().as_slice())
            .bind(event.kind as i64)
            .bind(event.d_value())
            .fetch_optional(&mut *tx)
            .await
            .map_err(StorageError::Database)?,
            StorageClass::Ephemeral => unreachable!("handled above"),
        };

        let outcome = match incumbent {
            Some((old_id_bytes, old_created)) => {
                let old_id =
                    EventId::from_slice(&old_id_bytes).map_err(|e| StorageError::Corrupt {
                        reason: e.to_string(),
                    })?;
                if replacement_wins(
                    event.created_at,
                    &event.event_id,
                    old_created as u64,
                    &old_id,
                ) {
                    Self::delete_event(&mut tx, &old_id_bytes).await?;
                    Self::insert_event(&mut tx, event).await?;
                    PutOutcome::Replaced(old_id)
                } else {
                    return Ok(PutOutcome::Duplicate);
                }
            }
            None => {
                Self::insert_event(&mut tx, event).await?;
                PutOutcome::Inserted
            }
        };

        tx.commit().await.map_err(StorageError::Database)?;
        Ok(outcome)
    }

    async fn query(&self, filter: &Filter) -> Result<Vec<Event>, StorageError> {
        enum Param {
            Int(i64),
            Blob(Vec<u8>),
        }

        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Param> = Vec::new();

        if let Some(kinds) = &filter.kinds {
            let placeholders: Vec<&str> = kinds.iter().map(|_| "?").collect();
            clauses.push(format!("kind IN ({})", placeholders.join(",")));
            params.extend(kinds.iter().map(|k| Param::Int(*k as i64)));
        }
        if let Some(prefixes) = &filter.pubkey_prefixes {
            let mut alts = Vec::with_capacity(prefixes.len());
            for prefix in prefixes {
                alts.push(format!("substr(pubkey, 1, {}) = ?", prefix.len()));
                params.push(Param::Blob(prefix.clone()));
            }
            clauses.push(format!("({})", alts.join(" OR ")));
        }
        if let Some(since) = filter.since {
            clauses.push("created_at >= ?".into());
            params.push(Param::Int(since as i64));
        }
        if let Some(until) = filter.until {
            clauses.push("created_at <= ?".into());
            params.push(Param::Int(until as i64));
        }

        let mut sql = String::from(
            "SELECT event_id, pubkey, kind, created_at, tags, content, sig FROM events",
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, event_id DESC");
        // tag predicates post-filter in memory, so the limit is applied
        // after that pass
        if filter.tags.is_none() {
            if let Some(limit) = filter.limit {
                sql.push_str(&format!(" LIMIT {limit}"));
            }
        }

        let mut query = sqlx::query_as::<_, EventRow>(&sql);
        for param in params {
            query = match param {
                Param::Int(v) => query.bind(v),
                Param::Blob(v) => query.bind(v),
            };
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let event: Event = row.try_into()?;
            if filter.matches(&event) {
                events.push(event);
            }
        }
        Ok(order_backfill(events, filter.limit))
    }

    async fn gc(&self, now_ns: u64, ttl_ns: u64) -> Result<u64, StorageError> {
        let cutoff = now_ns.saturating_sub(ttl_ns) as i64;
        let mut tx = self.pool.begin().await.map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            DELETE FROM event_tags WHERE event_id IN (
                SELECT event_id FROM events
                WHERE kind BETWEEN 0 AND 999 AND created_at < ?1
            )
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::Database)?;

        let result = sqlx::query(
            "DELETE FROM events WHERE kind BETWEEN 0 AND 999 AND created_at < ?1",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::Database)?;

        tx.commit().await.map_err(StorageError::Database)?;
        Ok(result.rows_affected())
    }

    async fn len(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await
            .map_err(StorageError::Database)?;
        Ok(count as u64)
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: Vec<u8>,
    pubkey: Vec<u8>,
    kind: i64,
    created_at: i64,
    tags: String,
    content: Vec<u8>,
    sig: Vec<u8>,
}

impl TryFrom<EventRow> for Event {
    type Error = StorageError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StorageError::Corrupt { reason };
        let tags: Vec<Tag> =
            serde_json::from_str(&row.tags).map_err(|e| corrupt(e.to_string()))?;
        Ok(Event {
            pubkey: Pubkey::from_slice(&row.pubkey).map_err(|e| corrupt(e.to_string()))?,
            created_at: row.created_at as u64,
            kind: row.kind as u16,
            tags,
            content: String::from_utf8(row.content).map_err(|e| corrupt(e.to_string()))?,
            event_id: EventId::from_slice(&row.event_id).map_err(|e| corrupt(e.to_string()))?,
            sig: Sig::from_slice(&row.sig).map_err(|e| corrupt(e.to_string()))?,
        })
    }
}
