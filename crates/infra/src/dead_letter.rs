//! Dead-letter publisher.

use thiserror::Error;
use tracing::{error, warn};

use newsrelay_events::{DeadLetterRecord, MessageChannel};

/// The dead-letter publish itself failed.
///
/// Never swallowed: the consumer must not acknowledge the original message,
/// so the channel redelivers it.
#[derive(Debug, Error)]
#[error("failed to dead-letter message (key '{correlation_key}') to '{destination}': {reason}")]
pub struct DeadLetterPublishFailure {
    pub destination: String,
    pub correlation_key: String,
    pub reason: String,
}

/// Parks messages on a dead-letter destination of the same channel.
#[derive(Debug, Clone)]
pub struct DeadLetterPublisher<C> {
    channel: C,
    destination: String,
}

impl<C: MessageChannel> DeadLetterPublisher<C> {
    pub fn new(channel: C, destination: impl Into<String>) -> Self {
        Self {
            channel,
            destination: destination.into(),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Publish the original payload bytes, keyed by `correlation_key`, with the
    /// retry count as a header. Completes only once the channel accepted it.
    pub async fn publish(
        &self,
        original_payload: &[u8],
        retry_count: u32,
        correlation_key: &str,
    ) -> Result<(), DeadLetterPublishFailure> {
        let record = DeadLetterRecord::new(original_payload, retry_count, correlation_key)
            .into_outbound(self.destination.clone());

        match self.channel.publish(record).await {
            Ok(()) => {
                warn!(
                    destination = %self.destination,
                    key = correlation_key,
                    retry_count,
                    "message dead-lettered"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    destination = %self.destination,
                    key = correlation_key,
                    retry_count,
                    error = %err,
                    "dead-letter publish failed"
                );
                Err(DeadLetterPublishFailure {
                    destination: self.destination.clone(),
                    correlation_key: correlation_key.to_string(),
                    reason: err.to_string(),
                })
            }
        }
    }
}
