//! Per-message CDC consumption.
//!
//! One message moves through:
//!
//! ```text
//! Received -> Decoded -> SkippedNonCreation | SkippedStale | Processing
//! Processing -> Committed | DeadLettered
//! ```
//!
//! Every terminal state (including dead-lettered) means the message may be
//! acknowledged. The only non-terminal exit is a failed dead-letter publish:
//! the message must stay unacknowledged so the channel redelivers it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, warn};

use newsrelay_core::Row;
use newsrelay_events::{ChangeEnvelope, Decoded, InboundMessage, MessageChannel};

use crate::dead_letter::{DeadLetterPublishFailure, DeadLetterPublisher};
use crate::registry::OperationRegistry;
use crate::resilience::{RetrySettings, execute};

use super::relay::{OperationError, RelayRoute};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Payload is not a change envelope.
    Undecodable,
    /// No route handles the event's source table.
    Unsupported,
    /// Row image lacks a readable key or timestamp.
    UnreadableRow,
    /// The business operation kept failing.
    RetriesExhausted,
}

/// Terminal state of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    SkippedNonCreation,
    SkippedMissingAfter,
    SkippedStale,
    Committed,
    DeadLettered(DeadLetterReason),
}

/// Consumer counters, readable while the consumer runs.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    committed: AtomicU64,
    skipped_non_creation: AtomicU64,
    skipped_missing_after: AtomicU64,
    skipped_stale: AtomicU64,
    dead_lettered: AtomicU64,
    decode_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub received: u64,
    pub committed: u64,
    pub skipped_non_creation: u64,
    /// Creation events without an `after` image; a sign of a broken producer.
    pub skipped_missing_after: u64,
    pub skipped_stale: u64,
    pub dead_lettered: u64,
    pub decode_failures: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            skipped_non_creation: self.skipped_non_creation.load(Ordering::Relaxed),
            skipped_missing_after: self.skipped_missing_after.load(Ordering::Relaxed),
            skipped_stale: self.skipped_stale.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::SkippedNonCreation => &self.skipped_non_creation,
            Outcome::SkippedMissingAfter => &self.skipped_missing_after,
            Outcome::SkippedStale => &self.skipped_stale,
            Outcome::Committed => &self.committed,
            Outcome::DeadLettered(reason) => {
                if reason == DeadLetterReason::Undecodable {
                    self.decode_failures.fetch_add(1, Ordering::Relaxed);
                }
                &self.dead_lettered
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Applies CDC messages through the routed business operation.
pub struct CdcConsumer<C> {
    name: String,
    routes: OperationRegistry<RelayRoute>,
    dead_letters: DeadLetterPublisher<C>,
    retry: RetrySettings,
    stats: Arc<ConsumerStats>,
}

impl<C: MessageChannel> CdcConsumer<C> {
    pub fn new(
        name: impl Into<String>,
        routes: OperationRegistry<RelayRoute>,
        dead_letters: DeadLetterPublisher<C>,
        retry: RetrySettings,
    ) -> Self {
        Self {
            name: name.into(),
            routes,
            dead_letters,
            retry,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    /// Drive one message to a terminal state.
    pub async fn handle(&self, message: &InboundMessage) -> Result<Outcome, DeadLetterPublishFailure> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let outcome = self.process(message).await?;
        self.stats.record(outcome);
        Ok(outcome)
    }

    async fn process(&self, message: &InboundMessage) -> Result<Outcome, DeadLetterPublishFailure> {
        let fallback_key = message.key.as_deref().unwrap_or(message.id.as_str());

        let envelope = match ChangeEnvelope::decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(consumer = %self.name, message_id = %message.id, error = %err, "undecodable change message");
                return self
                    .dead_letter(message, 0, fallback_key, DeadLetterReason::Undecodable)
                    .await;
            }
        };

        let route = self.routes.select(&envelope);
        let table = envelope.table().map(str::to_owned);

        let image = match envelope.classify() {
            Decoded::Apply(image) => image,
            Decoded::SkipNonCreation(_) => return Ok(Outcome::SkippedNonCreation),
            Decoded::SkipMissingAfter(_) => return Ok(Outcome::SkippedMissingAfter),
        };

        let route = match route {
            Ok(route) => route,
            Err(err) => {
                warn!(consumer = %self.name, table = ?table, error = %err, "no operation for change event");
                return self
                    .dead_letter(message, 0, fallback_key, DeadLetterReason::Unsupported)
                    .await;
            }
        };

        let row: Row = match route.identity().row(image) {
            Ok(row) => row,
            Err(err) => {
                warn!(consumer = %self.name, table = ?table, error = %err, "unreadable row image");
                return self
                    .dead_letter(message, 0, fallback_key, DeadLetterReason::UnreadableRow)
                    .await;
            }
        };

        if route.staleness().is_stale(&row.key, row.updated_at).await {
            return Ok(Outcome::SkippedStale);
        }

        let operation = route.operation();
        let result = execute(
            self.retry,
            |attempt, delay, err: &OperationError| {
                warn!(
                    consumer = %self.name,
                    operation = operation.name(),
                    key = %row.key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "operation failed; retrying"
                );
            },
            || operation.apply(&row),
        )
        .await;

        match result {
            Ok(()) => {
                debug!(consumer = %self.name, operation = operation.name(), key = %row.key, "change committed");
                Ok(Outcome::Committed)
            }
            Err(exhausted) => {
                warn!(
                    consumer = %self.name,
                    operation = operation.name(),
                    key = %row.key,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "operation exhausted its retries"
                );
                self.dead_letter(
                    message,
                    exhausted.retries(),
                    row.key.as_str(),
                    DeadLetterReason::RetriesExhausted,
                )
                .await
            }
        }
    }

    async fn dead_letter(
        &self,
        message: &InboundMessage,
        retry_count: u32,
        correlation_key: &str,
        reason: DeadLetterReason,
    ) -> Result<Outcome, DeadLetterPublishFailure> {
        self.dead_letters
            .publish(&message.payload, retry_count, correlation_key)
            .await?;
        Ok(Outcome::DeadLettered(reason))
    }
}

impl<C> core::fmt::Debug for CdcConsumer<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CdcConsumer")
            .field("name", &self.name)
            .field("routes", &self.routes)
            .field("retry", &self.retry)
            .finish()
    }
}
