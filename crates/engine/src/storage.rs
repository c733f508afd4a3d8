//! Storage contracts used by the engine, with in-memory and Postgres
//! implementations.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use db::models::SnapshotRow;
use db::DbPool;
use serde_json::Value;
use tokio::time::Instant;
use workflow::{FlowError, TransactionSnapshot};

// ---------------------------------------------------------------------------
// Transaction snapshots
// ---------------------------------------------------------------------------

/// Where finished (or suspended) transactions are kept for resumption and
/// inspection.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Insert or replace the snapshot, keyed by its transaction id.
    async fn save(&self, snapshot: &TransactionSnapshot) -> Result<(), FlowError>;

    async fn load(&self, transaction_id: &str) -> Result<Option<TransactionSnapshot>, FlowError>;

    /// Snapshots of one integration, newest first.
    async fn list(&self, integration_id: &str) -> Result<Vec<TransactionSnapshot>, FlowError>;

    /// Returns whether a snapshot was removed.
    async fn remove(&self, transaction_id: &str) -> Result<bool, FlowError>;
}

fn snapshot_key(snapshot: &TransactionSnapshot) -> Result<&str, FlowError> {
    snapshot
        .id
        .as_deref()
        .ok_or_else(|| FlowError::Storage("snapshot has no transaction id".into()))
}

/// Process-local [`SnapshotStore`].
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    /// Transaction id -> (save sequence number, snapshot).
    snapshots: Mutex<HashMap<String, (u64, TransactionSnapshot)>>,
    sequence: Mutex<u64>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &TransactionSnapshot) -> Result<(), FlowError> {
        let key = snapshot_key(snapshot)?.to_owned();
        let seq = {
            let mut seq = self.sequence.lock().unwrap_or_else(PoisonError::into_inner);
            *seq += 1;
            *seq
        };
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, (seq, snapshot.clone()));
        Ok(())
    }

    async fn load(&self, transaction_id: &str) -> Result<Option<TransactionSnapshot>, FlowError> {
        Ok(self
            .snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(transaction_id)
            .map(|(_, snapshot)| snapshot.clone()))
    }

    async fn list(&self, integration_id: &str) -> Result<Vec<TransactionSnapshot>, FlowError> {
        let snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<_> = snapshots
            .values()
            .filter(|(_, s)| s.integration_id.as_deref() == Some(integration_id))
            .collect();
        found.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(found.into_iter().map(|(_, s)| s.clone()).collect())
    }

    async fn remove(&self, transaction_id: &str) -> Result<bool, FlowError> {
        Ok(self
            .snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(transaction_id)
            .is_some())
    }
}

/// [`SnapshotStore`] backed by the `transaction_snapshots` table.
#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: DbPool,
}

impl PgSnapshotStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn save(&self, snapshot: &TransactionSnapshot) -> Result<(), FlowError> {
        let id = snapshot_key(snapshot)?;
        db::repository::snapshots::upsert_snapshot(
            &self.pool,
            id,
            snapshot.integration_id.as_deref().unwrap_or_default(),
            snapshot.step.as_deref(),
            snapshot.failed,
            serde_json::to_value(snapshot)?,
        )
        .await?;
        Ok(())
    }

    async fn load(&self, transaction_id: &str) -> Result<Option<TransactionSnapshot>, FlowError> {
        let row = db::repository::snapshots::get_snapshot(&self.pool, transaction_id).await?;
        Ok(row.map(SnapshotRow::decode).transpose()?)
    }

    async fn list(&self, integration_id: &str) -> Result<Vec<TransactionSnapshot>, FlowError> {
        db::repository::snapshots::list_snapshots(&self.pool, integration_id)
            .await?
            .into_iter()
            .map(|r| r.decode().map_err(FlowError::from))
            .collect()
    }

    async fn remove(&self, transaction_id: &str) -> Result<bool, FlowError> {
        match db::repository::snapshots::delete_snapshot(&self.pool, transaction_id).await {
            Ok(()) => Ok(true),
            Err(db::DbError::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Key-value store
// ---------------------------------------------------------------------------

/// Key-value storage with optional time-to-live, plus advisory locks.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), FlowError>;

    async fn get(&self, key: &str) -> Result<Option<Value>, FlowError>;

    async fn exists(&self, key: &str) -> Result<bool, FlowError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn remove(&self, key: &str) -> Result<(), FlowError>;

    /// Try to take the lock `key`; `false` if someone else holds it.
    ///
    /// A lock with a `ttl` is released automatically once it expires.
    async fn lock(&self, key: &str, ttl: Option<Duration>) -> Result<bool, FlowError>;

    async fn unlock(&self, key: &str) -> Result<(), FlowError>;
}

#[derive(Debug)]
struct Entry<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Entry<T> {
    fn new(value: T, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// Process-local [`KvStore`]; expired entries are dropped lazily.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Entry<Value>>>,
    locks: Mutex<HashMap<String, Entry<()>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), FlowError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), Entry::new(value, ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, FlowError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some(entry) if entry.is_live() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn remove(&self, key: &str) -> Result<(), FlowError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    async fn lock(&self, key: &str, ttl: Option<Duration>) -> Result<bool, FlowError> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, entry| entry.is_live());
        if locks.contains_key(key) {
            return Ok(false);
        }
        locks.insert(key.to_owned(), Entry::new((), ttl));
        Ok(true)
    }

    async fn unlock(&self, key: &str) -> Result<(), FlowError> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}
