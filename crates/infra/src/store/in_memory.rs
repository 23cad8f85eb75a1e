use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use newsrelay_core::{Row, RowKey};

use super::{RowStore, StoreError, retain_new_rows};

/// In-memory row store for tests/dev.
///
/// [`InMemoryRowStore::fail_next_writes`] and [`InMemoryRowStore::fail_reads`]
/// inject outages so retry and fail-open paths can be exercised.
#[derive(Debug, Default)]
pub struct InMemoryRowStore {
    rows: RwLock<HashMap<RowKey, Row>>,
    failing_writes: AtomicU32,
    failing_reads: AtomicU32,
}

impl InMemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with [`StoreError::Unavailable`].
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` reads fail with [`StoreError::Unavailable`].
    pub fn fail_reads(&self, n: u32) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    pub fn get(&self, key: &RowKey) -> Option<Row> {
        self.rows.read().ok()?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|r| r.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored keys, sorted.
    pub fn keys(&self) -> Vec<RowKey> {
        let mut keys: Vec<RowKey> = self
            .rows
            .read()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    fn take_failure(counter: &AtomicU32, what: &str) -> Result<(), StoreError> {
        let took = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            return Err(StoreError::Unavailable(format!("injected {what} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl RowStore for InMemoryRowStore {
    async fn save(&self, row: Row) -> Result<(), StoreError> {
        Self::take_failure(&self.failing_writes, "write")?;
        let mut rows = self.rows.write().map_err(|_| StoreError::Poisoned)?;
        rows.insert(row.key.clone(), row);
        Ok(())
    }

    async fn save_all(&self, rows: Vec<Row>) -> Result<usize, StoreError> {
        Self::take_failure(&self.failing_writes, "write")?;
        let mut stored = self.rows.write().map_err(|_| StoreError::Poisoned)?;

        let existing: HashSet<RowKey> = rows
            .iter()
            .filter(|r| stored.contains_key(&r.key))
            .map(|r| r.key.clone())
            .collect();
        let fresh = retain_new_rows(rows, &existing);
        let inserted = fresh.len();
        for row in fresh {
            stored.insert(row.key.clone(), row);
        }
        Ok(inserted)
    }

    async fn find_existing_keys(&self, keys: &[RowKey]) -> Result<HashSet<RowKey>, StoreError> {
        Self::take_failure(&self.failing_reads, "read")?;
        let rows = self.rows.read().map_err(|_| StoreError::Poisoned)?;
        Ok(keys.iter().filter(|k| rows.contains_key(*k)).cloned().collect())
    }

    async fn find_timestamp_by_key(&self, key: &RowKey) -> Result<Option<DateTime<Utc>>, StoreError> {
        Self::take_failure(&self.failing_reads, "read")?;
        let rows = self.rows.read().map_err(|_| StoreError::Poisoned)?;
        Ok(rows.get(key).map(|r| r.updated_at))
    }
}
