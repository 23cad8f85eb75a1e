//! Postgres-backed row store.
//!
//! Each store owns one table shaped as:
//!
//! ```sql
//! CREATE TABLE <name> (
//!     key        TEXT PRIMARY KEY,
//!     updated_at TIMESTAMPTZ NOT NULL,
//!     body       JSONB NOT NULL
//! );
//! ```
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | Any other | `Query` |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Unavailable` |
//! | Other | N/A | `Query` |
//!
//! `Conflict` and `Unavailable` are transient; callers retry them through the
//! retry executor like any other failure.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row as _};
use tracing::instrument;

use newsrelay_core::{Row, RowKey};

use super::{RowStore, StoreError, retain_new_rows};

#[derive(Debug, Clone)]
struct Statements {
    upsert: String,
    insert_new: String,
    existing_keys: String,
    timestamp_by_key: String,
    create_table: String,
}

impl Statements {
    fn for_table(table: &str) -> Self {
        Self {
            upsert: format!(
                "INSERT INTO {table} (key, updated_at, body) VALUES ($1, $2, $3) \
                 ON CONFLICT (key) DO UPDATE SET updated_at = EXCLUDED.updated_at, body = EXCLUDED.body"
            ),
            insert_new: format!(
                "INSERT INTO {table} (key, updated_at, body) VALUES ($1, $2, $3) \
                 ON CONFLICT (key) DO NOTHING"
            ),
            existing_keys: format!("SELECT key FROM {table} WHERE key = ANY($1)"),
            timestamp_by_key: format!("SELECT updated_at FROM {table} WHERE key = $1"),
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 key TEXT PRIMARY KEY, \
                 updated_at TIMESTAMPTZ NOT NULL, \
                 body JSONB NOT NULL)"
            ),
        }
    }
}

/// Row store backed by one Postgres table.
///
/// The table name is validated once at construction and then baked into the
/// statements; it is never taken from message content.
#[derive(Debug, Clone)]
pub struct PostgresRowStore {
    pool: Arc<PgPool>,
    table: String,
    sql: Arc<Statements>,
}

impl PostgresRowStore {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self, StoreError> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self {
            pool: Arc::new(pool),
            sql: Arc::new(Statements::for_table(&table)),
            table,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the table if it does not exist (dev/test databases).
    #[instrument(skip(self), fields(table = %self.table), err)]
    pub async fn ensure_table(&self) -> Result<(), StoreError> {
        sqlx::query(&self.sql.create_table)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_table", e))?;
        Ok(())
    }
}

#[async_trait]
impl RowStore for PostgresRowStore {
    #[instrument(skip(self, row), fields(table = %self.table, key = %row.key), err)]
    async fn save(&self, row: Row) -> Result<(), StoreError> {
        sqlx::query(&self.sql.upsert)
            .bind(row.key.as_str())
            .bind(row.updated_at)
            .bind(&row.body)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("save", e))?;
        Ok(())
    }

    #[instrument(skip(self, rows), fields(table = %self.table, rows = rows.len()), err)]
    async fn save_all(&self, rows: Vec<Row>) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let keys: Vec<RowKey> = rows.iter().map(|r| r.key.clone()).collect();
        let existing = self.find_existing_keys(&keys).await?;
        let fresh = retain_new_rows(rows, &existing);
        if fresh.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("save_all", e))?;

        // ON CONFLICT DO NOTHING covers rows inserted between the existence
        // check and this transaction.
        let mut inserted = 0u64;
        for row in &fresh {
            let result = sqlx::query(&self.sql.insert_new)
                .bind(row.key.as_str())
                .bind(row.updated_at)
                .bind(&row.body)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("save_all", e))?;
            inserted += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("save_all", e))?;

        Ok(inserted as usize)
    }

    #[instrument(skip(self, keys), fields(table = %self.table, keys = keys.len()), err)]
    async fn find_existing_keys(&self, keys: &[RowKey]) -> Result<HashSet<RowKey>, StoreError> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }

        let raw: Vec<&str> = keys.iter().map(RowKey::as_str).collect();
        let rows = sqlx::query(&self.sql.existing_keys)
            .bind(&raw)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_existing_keys", e))?;

        rows.iter()
            .map(|row| {
                let key: String = row
                    .try_get("key")
                    .map_err(|e| map_sqlx_error("find_existing_keys", e))?;
                RowKey::new(key).map_err(|e| StoreError::Invalid(e.to_string()))
            })
            .collect()
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    async fn find_timestamp_by_key(&self, key: &RowKey) -> Result<Option<DateTime<Utc>>, StoreError> {
        sqlx::query_scalar::<_, DateTime<Utc>>(&self.sql.timestamp_by_key)
            .bind(key.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_timestamp_by_key", e))
    }
}

/// Accepts `name` or `schema.name`, each an unquoted SQL identifier.
fn validate_table_name(table: &str) -> Result<(), StoreError> {
    let parts: Vec<&str> = table.split('.').collect();
    let valid = parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });

    if valid {
        Ok(())
    } else {
        Err(StoreError::Invalid(format!("invalid table name '{table}'")))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Query(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::Io(io) => StoreError::Unavailable(format!("io error in {}: {}", operation, io)),
        _ => StoreError::Query(format!("sqlx error in {}: {}", operation, err)),
    }
}
