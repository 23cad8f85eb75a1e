//! Process configuration from `NEWSRELAY_*` environment variables.
//!
//! Every value has a default except the database URL, which only the
//! commands that touch Postgres require. Each retry call site gets its own
//! [`RetrySettings`]; nothing shares a global budget.

use core::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use newsrelay_core::{RowIdentity, TimestampFormat};
use newsrelay_observability::LogFormat;

use crate::pipelines::CollectionSettings;
use crate::resilience::{BatchSettings, RetrySettings};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var} is not set")]
    Missing { var: &'static str },

    #[error("invalid {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// One CDC relay: where it reads, where it parks failures, where it writes.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayStreamConfig {
    pub stream: String,
    pub dlq_stream: String,
    /// `source.table` of the change events this relay handles.
    pub source_table: String,
    /// Downstream table the relay writes into (and checks staleness against).
    pub target_table: String,
    pub identity: RowIdentity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    pub group: String,
    pub name: String,
    pub batch_size: usize,
    pub block: Duration,
    pub dlq_partitions: u32,
    pub operation_retry: RetrySettings,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group: "newsrelay".to_string(),
            name: "newsrelay-1".to_string(),
            batch_size: 100,
            block: Duration::from_millis(2000),
            dlq_partitions: 1,
            operation_retry: RetrySettings::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_operation_retry(mut self, retry: RetrySettings) -> Self {
        self.operation_retry = retry;
        self
    }

    pub fn with_dlq_partitions(mut self, partitions: u32) -> Self {
        self.dlq_partitions = partitions.max(1);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub redis_url: String,
    pub source: SourceConfig,
    pub collection: CollectionSettings,
    pub consumer: ConsumerConfig,
    pub article_relay: RelayStreamConfig,
    pub analysis_relay: RelayStreamConfig,
    /// Fields copied into analysis search documents (empty = whole row).
    pub analysis_fields: Vec<String>,
    pub log_format: LogFormat,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let page_retry = env.retry("PAGE")?;
        let collection = CollectionSettings::default()
            .with_page_size(env.positive("NEWSRELAY_PAGE_SIZE", 100)?)
            .with_first_page_retry(page_retry)
            .with_batch(BatchSettings {
                unit_retry: page_retry,
                resweeps: env.parse("NEWSRELAY_BATCH_RESWEEPS", 1)?,
                concurrency: env.positive("NEWSRELAY_BATCH_CONCURRENCY", 1)?,
            })
            .with_identity(
                RowIdentity::new(
                    env.string("NEWSRELAY_ARTICLE_KEY_FIELD", "id"),
                    env.string("NEWSRELAY_ARTICLE_TIMESTAMP_FIELD", "published_at"),
                )
                .with_timestamp_format(env.timestamp_format("NEWSRELAY_ARTICLE_TIMESTAMP_FORMAT")?),
            );

        let cdc_identity = RowIdentity::new(
            env.string("NEWSRELAY_CDC_KEY_FIELD", "id"),
            env.string("NEWSRELAY_CDC_TIMESTAMP_FIELD", "updated_at"),
        )
        .with_timestamp_format(env.timestamp_format("NEWSRELAY_CDC_TIMESTAMP_FORMAT")?);

        let consumer = ConsumerConfig {
            group: env.string("NEWSRELAY_CONSUMER_GROUP", "newsrelay"),
            name: env.string("NEWSRELAY_CONSUMER_NAME", "newsrelay-1"),
            batch_size: env.positive("NEWSRELAY_CONSUMER_BATCH_SIZE", 100)?,
            block: Duration::from_millis(env.parse("NEWSRELAY_CONSUMER_BLOCK_MS", 2000)?),
            dlq_partitions: env.positive("NEWSRELAY_DLQ_PARTITIONS", 1)?,
            operation_retry: env.retry("OPERATION")?,
        };

        let analysis_fields = env
            .string("NEWSRELAY_ANALYSIS_FIELDS", "")
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            database_url: env.optional("NEWSRELAY_DATABASE_URL"),
            database_max_connections: env.positive("NEWSRELAY_DATABASE_MAX_CONNECTIONS", 10)?,
            redis_url: env.string("NEWSRELAY_REDIS_URL", "redis://127.0.0.1:6379"),
            source: SourceConfig {
                base_url: env.optional("NEWSRELAY_SOURCE_URL"),
                api_key: env.optional("NEWSRELAY_SOURCE_API_KEY"),
                timeout: Duration::from_millis(env.positive("NEWSRELAY_SOURCE_TIMEOUT_MS", 30_000)?),
            },
            collection,
            consumer,
            article_relay: RelayStreamConfig {
                stream: env.string("NEWSRELAY_ARTICLE_STREAM", "newsrelay.articles.cdc"),
                dlq_stream: env.string("NEWSRELAY_ARTICLE_DLQ", "newsrelay.articles.dlq"),
                source_table: env.string("NEWSRELAY_ARTICLE_SOURCE_TABLE", "articles"),
                target_table: env.string("NEWSRELAY_ARTICLE_TARGET_TABLE", "relayed_articles"),
                identity: cdc_identity.clone(),
            },
            analysis_relay: RelayStreamConfig {
                stream: env.string("NEWSRELAY_ANALYSIS_STREAM", "newsrelay.analysis.cdc"),
                dlq_stream: env.string("NEWSRELAY_ANALYSIS_DLQ", "newsrelay.analysis.dlq"),
                source_table: env.string("NEWSRELAY_ANALYSIS_SOURCE_TABLE", "analysis_results"),
                target_table: env.string("NEWSRELAY_ANALYSIS_INDEX", "analysis_index"),
                identity: cdc_identity,
            },
            analysis_fields,
            log_format: env.parse("NEWSRELAY_LOG_FORMAT", LogFormat::Json)?,
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url.as_deref().ok_or(ConfigError::Missing {
            var: "NEWSRELAY_DATABASE_URL",
        })
    }

    pub fn require_source_url(&self) -> Result<&str, ConfigError> {
        self.source.base_url.as_deref().ok_or(ConfigError::Missing {
            var: "NEWSRELAY_SOURCE_URL",
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, var: &str) -> Option<String> {
        (self.0)(var).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, var: &str, default: &str) -> String {
        self.optional(var).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: core::fmt::Display,
    {
        match self.optional(var) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
            }),
        }
    }

    fn positive<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + Default,
        T::Err: core::fmt::Display,
    {
        let value = self.parse(var, default)?;
        if value <= T::default() {
            return Err(ConfigError::Invalid {
                var,
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(value)
    }

    fn timestamp_format(&self, var: &'static str) -> Result<TimestampFormat, ConfigError> {
        match self.optional(var).as_deref().map(str::trim) {
            None | Some("rfc3339") => Ok(TimestampFormat::Rfc3339),
            Some("epoch_millis") => Ok(TimestampFormat::EpochMillis),
            Some("epoch_micros") => Ok(TimestampFormat::EpochMicros),
            Some(other) => Err(ConfigError::Invalid {
                var,
                reason: format!("unknown timestamp format '{other}'"),
            }),
        }
    }

    /// `NEWSRELAY_{prefix}_MAX_RETRIES`, `_BASE_DELAY_MS`, `_BACKOFF_FACTOR`.
    fn retry(&self, prefix: &'static str) -> Result<RetrySettings, ConfigError> {
        let (max_var, delay_var, factor_var) = match prefix {
            "PAGE" => (
                "NEWSRELAY_PAGE_MAX_RETRIES",
                "NEWSRELAY_PAGE_BASE_DELAY_MS",
                "NEWSRELAY_PAGE_BACKOFF_FACTOR",
            ),
            _ => (
                "NEWSRELAY_OPERATION_MAX_RETRIES",
                "NEWSRELAY_OPERATION_BASE_DELAY_MS",
                "NEWSRELAY_OPERATION_BACKOFF_FACTOR",
            ),
        };

        let defaults = RetrySettings::default();
        let factor: f64 = self.parse(factor_var, defaults.backoff_factor)?;
        if !factor.is_finite() || factor < 1.0 {
            return Err(ConfigError::Invalid {
                var: factor_var,
                reason: "must be a finite number >= 1.0".to_string(),
            });
        }

        Ok(RetrySettings::new(
            self.parse(max_var, defaults.max_retries)?,
            Duration::from_millis(self.parse(delay_var, defaults.base_delay.as_millis() as u64)?),
            factor,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<RelayConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RelayConfig::from_lookup(|var| map.get(var).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = config(&[]).unwrap();

        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.collection.page_size, 100);
        assert_eq!(cfg.collection.batch.resweeps, 1);
        assert_eq!(cfg.collection.batch.concurrency, 1);
        assert_eq!(cfg.consumer.operation_retry, RetrySettings::default());
        assert_eq!(cfg.article_relay.source_table, "articles");
        assert_eq!(cfg.analysis_relay.source_table, "analysis_results");
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert!(cfg.require_database_url().is_err());
    }

    #[test]
    fn call_sites_get_independent_retry_settings() {
        let cfg = config(&[
            ("NEWSRELAY_PAGE_MAX_RETRIES", "5"),
            ("NEWSRELAY_PAGE_BASE_DELAY_MS", "250"),
            ("NEWSRELAY_OPERATION_MAX_RETRIES", "2"),
            ("NEWSRELAY_OPERATION_BACKOFF_FACTOR", "3.0"),
        ])
        .unwrap();

        assert_eq!(cfg.collection.first_page_retry.max_retries, 5);
        assert_eq!(cfg.collection.batch.unit_retry.base_delay, Duration::from_millis(250));
        assert_eq!(cfg.consumer.operation_retry.max_retries, 2);
        assert_eq!(cfg.consumer.operation_retry.backoff_factor, 3.0);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = config(&[("NEWSRELAY_PAGE_SIZE", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "NEWSRELAY_PAGE_SIZE", .. }));

        let err = config(&[("NEWSRELAY_OPERATION_BACKOFF_FACTOR", "0.5")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { var: "NEWSRELAY_OPERATION_BACKOFF_FACTOR", .. }
        ));

        let err = config(&[("NEWSRELAY_CDC_TIMESTAMP_FORMAT", "unix")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "NEWSRELAY_CDC_TIMESTAMP_FORMAT", .. }));

        let err = config(&[("NEWSRELAY_LOG_FORMAT", "xml")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "NEWSRELAY_LOG_FORMAT", .. }));
    }

    #[test]
    fn analysis_fields_are_a_comma_list() {
        let cfg = config(&[("NEWSRELAY_ANALYSIS_FIELDS", "article_id, sentiment,,topics")]).unwrap();
        assert_eq!(cfg.analysis_fields, vec!["article_id", "sentiment", "topics"]);
    }
}
