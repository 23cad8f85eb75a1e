//! The three pipelines built on the resilience primitives.
//!
//! - [`collection`]: daily article collection from the paginated source
//! - [`relay`]: business operations for the article and analysis-result relays
//! - [`consumer`]: per-message CDC state machine shared by both relays

pub mod collection;
pub mod consumer;
pub mod relay;

pub use collection::{ArticleCollector, CollectionError, CollectionReport, CollectionSettings, PageError};
pub use consumer::{CdcConsumer, ConsumerStats, ConsumerStatsSnapshot, DeadLetterReason, Outcome};
pub use relay::{BusinessOperation, IndexDocument, OperationError, RelayRoute, UpsertRow};
