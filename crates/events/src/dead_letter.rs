//! Dead-letter record (what gets parked when a message cannot be applied).

use crate::channel::OutboundRecord;

/// Header carrying the number of retries spent before the message was parked.
pub const RETRY_COUNT_HEADER: &str = "dlq-retry-count";

/// A message that exhausted its retries.
///
/// The payload is the byte-exact input; it is never re-encoded so a replay
/// tool can feed it back to the consumer unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    original_payload: Vec<u8>,
    retry_count: u32,
    correlation_key: String,
}

impl DeadLetterRecord {
    pub fn new(original_payload: impl Into<Vec<u8>>, retry_count: u32, correlation_key: impl Into<String>) -> Self {
        Self {
            original_payload: original_payload.into(),
            retry_count,
            correlation_key: correlation_key.into(),
        }
    }

    pub fn original_payload(&self) -> &[u8] {
        &self.original_payload
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn correlation_key(&self) -> &str {
        &self.correlation_key
    }

    /// Address the record to `destination`, keyed by the correlation key.
    pub fn into_outbound(self, destination: impl Into<String>) -> OutboundRecord {
        OutboundRecord::new(destination, self.correlation_key, self.original_payload)
            .with_header(RETRY_COUNT_HEADER, self.retry_count.to_string())
    }
}
