//! Business operations the CDC relays apply, and the routes that select them.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use newsrelay_core::{Row, RowIdentity};
use newsrelay_events::ChangeEnvelope;

use crate::registry::Capability;
use crate::staleness::StalenessGuard;
use crate::store::{RowStore, StoreError};

#[derive(Debug, Error)]
pub enum OperationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("operation rejected the row: {0}")]
    Rejected(String),
}

/// The effect a relay has for one accepted row.
///
/// Implementations must be idempotent per key: the channel is at-least-once
/// and the retry executor re-invokes `apply` on failure.
#[async_trait]
pub trait BusinessOperation: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, row: &Row) -> Result<(), OperationError>;
}

/// Article relay: upserts the article row into the downstream store.
#[derive(Debug, Clone)]
pub struct UpsertRow<S> {
    name: String,
    store: S,
}

impl<S: RowStore> UpsertRow<S> {
    pub fn new(name: impl Into<String>, store: S) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }
}

#[async_trait]
impl<S: RowStore> BusinessOperation for UpsertRow<S> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, row: &Row) -> Result<(), OperationError> {
        self.store.save(row.clone()).await?;
        Ok(())
    }
}

/// Analysis relay: indexes an analysis result as a search document.
///
/// The document keeps only `fields` (all fields when empty); a row missing
/// every projected field is rejected rather than indexed empty.
#[derive(Debug, Clone)]
pub struct IndexDocument<S> {
    name: String,
    index: S,
    fields: Vec<String>,
}

impl<S: RowStore> IndexDocument<S> {
    pub fn new(name: impl Into<String>, index: S) -> Self {
        Self {
            name: name.into(),
            index,
            fields: Vec::new(),
        }
    }

    pub fn with_fields<I, F>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    fn document(&self, row: &Row) -> Result<JsonValue, OperationError> {
        if self.fields.is_empty() {
            return Ok(row.body.clone());
        }

        let source = row
            .body
            .as_object()
            .ok_or_else(|| OperationError::Rejected("row body is not an object".into()))?;
        let projected: Map<String, JsonValue> = self
            .fields
            .iter()
            .filter_map(|f| source.get(f).map(|v| (f.clone(), v.clone())))
            .collect();

        if projected.is_empty() {
            return Err(OperationError::Rejected(format!(
                "none of the indexed fields {:?} present",
                self.fields
            )));
        }
        Ok(JsonValue::Object(projected))
    }
}

#[async_trait]
impl<S: RowStore> BusinessOperation for IndexDocument<S> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, row: &Row) -> Result<(), OperationError> {
        let document = Row::new(row.key.clone(), row.updated_at, self.document(row)?);
        self.index.save(document).await?;
        Ok(())
    }
}

/// Binds a source table to the operation that handles its change events,
/// together with the store its staleness is checked against.
pub struct RelayRoute {
    table: Option<String>,
    identity: RowIdentity,
    staleness: StalenessGuard<Arc<dyn RowStore>>,
    operation: Arc<dyn BusinessOperation>,
}

impl RelayRoute {
    /// Route events whose `source.table` equals `table`.
    pub fn for_table(
        table: impl Into<String>,
        identity: RowIdentity,
        guard_store: Arc<dyn RowStore>,
        operation: Arc<dyn BusinessOperation>,
    ) -> Self {
        Self {
            table: Some(table.into()),
            identity,
            staleness: StalenessGuard::new(guard_store),
            operation,
        }
    }

    /// Route every event, whatever its table (single-table streams).
    pub fn any_table(
        identity: RowIdentity,
        guard_store: Arc<dyn RowStore>,
        operation: Arc<dyn BusinessOperation>,
    ) -> Self {
        Self {
            table: None,
            identity,
            staleness: StalenessGuard::new(guard_store),
            operation,
        }
    }

    pub fn identity(&self) -> &RowIdentity {
        &self.identity
    }

    pub fn staleness(&self) -> &StalenessGuard<Arc<dyn RowStore>> {
        &self.staleness
    }

    pub fn operation(&self) -> &dyn BusinessOperation {
        self.operation.as_ref()
    }
}

impl core::fmt::Debug for RelayRoute {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RelayRoute")
            .field("table", &self.table)
            .field("identity", &self.identity)
            .field("operation", &self.operation.name())
            .finish()
    }
}

impl Capability<ChangeEnvelope> for RelayRoute {
    fn name(&self) -> &str {
        self.operation.name()
    }

    fn supports(&self, envelope: &ChangeEnvelope) -> bool {
        match &self.table {
            Some(table) => envelope.table() == Some(table.as_str()),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use newsrelay_core::RowKey;
    use serde_json::json;

    use crate::store::InMemoryRowStore;

    fn row(body: JsonValue) -> Row {
        Row::new(RowKey::new("r1").unwrap(), Utc::now(), body)
    }

    #[tokio::test]
    async fn index_document_projects_configured_fields() {
        let index = Arc::new(InMemoryRowStore::new());
        let op = IndexDocument::new("analysis", index.clone()).with_fields(["article_id", "sentiment"]);

        op.apply(&row(json!({ "article_id": "a1", "sentiment": 0.7, "raw": "..." })))
            .await
            .unwrap();

        let stored = index.get(&RowKey::new("r1").unwrap()).unwrap();
        assert_eq!(stored.body, json!({ "article_id": "a1", "sentiment": 0.7 }));
    }

    #[tokio::test]
    async fn index_document_rejects_rows_without_indexed_fields() {
        let index = Arc::new(InMemoryRowStore::new());
        let op = IndexDocument::new("analysis", index.clone()).with_fields(["sentiment"]);

        let err = op.apply(&row(json!({ "other": 1 }))).await.unwrap_err();

        assert!(matches!(err, OperationError::Rejected(_)));
        assert!(index.is_empty());
    }

    #[test]
    fn routes_match_on_source_table() {
        let store: Arc<dyn RowStore> = Arc::new(InMemoryRowStore::new());
        let route = RelayRoute::for_table(
            "articles",
            RowIdentity::new("id", "updated_at"),
            store.clone(),
            Arc::new(UpsertRow::new("article-relay", store)),
        );

        let envelope = |table: &str| {
            ChangeEnvelope::decode(
                json!({ "op": "c", "after": {}, "source": { "table": table } })
                    .to_string()
                    .as_bytes(),
            )
            .unwrap()
        };

        assert!(route.supports(&envelope("articles")));
        assert!(!route.supports(&envelope("analysis_results")));
        assert_eq!(Capability::<ChangeEnvelope>::name(&route), "article-relay");
    }
}
