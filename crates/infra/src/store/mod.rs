//! Downstream row stores.
//!
//! Every pipeline ends in a store keyed by [`RowKey`]: the collection pipeline
//! inserts fetched articles, the relays upsert CDC row images. The trait is the
//! seam; [`InMemoryRowStore`] backs tests and [`PostgresRowStore`] backs production.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use newsrelay_core::{Row, RowKey};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryRowStore;
pub use postgres::PostgresRowStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Concurrent writer won a uniqueness race; safe to retry.
    #[error("write conflict: {0}")]
    Conflict(String),

    /// Store not reachable (pool closed, network, timeout).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("query failed: {0}")]
    Query(String),

    /// Store was misconfigured or returned data it should not hold.
    #[error("invalid store state: {0}")]
    Invalid(String),

    #[error("store lock poisoned")]
    Poisoned,
}

#[async_trait]
pub trait RowStore: Send + Sync {
    /// Insert or replace the row with this key (last write wins).
    async fn save(&self, row: Row) -> Result<(), StoreError>;

    /// Insert rows whose key is not stored yet; returns how many were inserted.
    ///
    /// Keys already present, and repeated keys within `rows`, are skipped
    /// (first occurrence wins), so re-running a page never duplicates rows.
    async fn save_all(&self, rows: Vec<Row>) -> Result<usize, StoreError>;

    /// Subset of `keys` already present.
    async fn find_existing_keys(&self, keys: &[RowKey]) -> Result<HashSet<RowKey>, StoreError>;

    /// Recorded timestamp for `key`, if the row exists.
    async fn find_timestamp_by_key(&self, key: &RowKey) -> Result<Option<DateTime<Utc>>, StoreError>;
}

#[async_trait]
impl<S> RowStore for Arc<S>
where
    S: RowStore + ?Sized,
{
    async fn save(&self, row: Row) -> Result<(), StoreError> {
        (**self).save(row).await
    }

    async fn save_all(&self, rows: Vec<Row>) -> Result<usize, StoreError> {
        (**self).save_all(rows).await
    }

    async fn find_existing_keys(&self, keys: &[RowKey]) -> Result<HashSet<RowKey>, StoreError> {
        (**self).find_existing_keys(keys).await
    }

    async fn find_timestamp_by_key(&self, key: &RowKey) -> Result<Option<DateTime<Utc>>, StoreError> {
        (**self).find_timestamp_by_key(key).await
    }
}

/// Drop rows whose key is in `existing` or already seen earlier in `rows`.
pub(crate) fn retain_new_rows(rows: Vec<Row>, existing: &HashSet<RowKey>) -> Vec<Row> {
    let mut seen = HashSet::with_capacity(rows.len());
    rows.into_iter()
        .filter(|row| !existing.contains(&row.key) && seen.insert(row.key.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(key: &str) -> Row {
        Row::new(RowKey::new(key).unwrap(), Utc::now(), json!({ "id": key }))
    }

    #[test]
    fn retain_new_rows_skips_existing_and_in_batch_duplicates() {
        let existing: HashSet<RowKey> = [RowKey::new("a").unwrap()].into_iter().collect();
        let rows = vec![row("a"), row("b"), row("c"), row("b")];

        let kept: Vec<String> = retain_new_rows(rows, &existing)
            .into_iter()
            .map(|r| r.key.into_inner())
            .collect();

        assert_eq!(kept, vec!["b", "c"]);
    }
}
