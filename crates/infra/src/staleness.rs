//! Staleness guard: drops change events older than what the store already holds.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use newsrelay_core::RowKey;

use crate::store::RowStore;

/// Compares a candidate timestamp against the stored row's timestamp.
///
/// Fails open: when the lookup itself fails the event is treated as fresh,
/// because the write that follows is an idempotent upsert and dropping a
/// change is worse than applying it twice.
#[derive(Debug, Clone)]
pub struct StalenessGuard<S> {
    store: S,
}

impl<S: RowStore> StalenessGuard<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// `true` when a row with `key` exists and its recorded timestamp is at or
    /// after `candidate`. A redelivered event carries an equal timestamp and is stale.
    pub async fn is_stale(&self, key: &RowKey, candidate: DateTime<Utc>) -> bool {
        match self.store.find_timestamp_by_key(key).await {
            Ok(Some(recorded)) if recorded >= candidate => {
                debug!(
                    key = %key,
                    recorded = %recorded,
                    candidate = %candidate,
                    "stale change event"
                );
                true
            }
            Ok(_) => false,
            Err(err) => {
                warn!(key = %key, error = %err, "staleness lookup failed; treating event as fresh");
                false
            }
        }
    }
}
