//! Message channel abstraction (mechanics only).
//!
//! A channel is the transport both CDC relays sit on: it **delivers** raw change
//! messages to a consumer and **accepts** dead-letter publishes from it.
//!
//! ## Delivery Guarantees
//!
//! Channels are assumed to be **at-least-once**:
//! - A message stays pending until it is acknowledged
//! - Unacknowledged messages are redelivered (after a crash, a failed dead-letter publish, ...)
//! - Ordering is only guaranteed per key/partition, and only by the channel itself
//!
//! Consumers must therefore be idempotent. The relays get there through the
//! staleness guard plus upsert-by-key writes.
//!
//! ## Acknowledgement
//!
//! A consumer acknowledges a message only once it reached a terminal state
//! (skipped, committed, or dead-lettered). Offset bookkeeping itself is the
//! channel's business.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use newsrelay_core::MessageId;

/// A raw message delivered by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: MessageId,
    /// Partition/routing key the producer attached, if any.
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(id: MessageId, key: Option<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            key,
            payload: payload.into(),
        }
    }
}

/// A record handed to a channel for publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    /// Logical destination (topic / stream name).
    pub destination: String,
    /// Routing key; records sharing a key land on the same partition.
    pub key: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

impl OutboundRecord {
    pub fn new(destination: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            destination: destination.into(),
            key: key.into(),
            headers: BTreeMap::new(),
            payload,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Transport-agnostic message channel.
///
/// `publish()` must only return `Ok` once the underlying transport has
/// acknowledged the write; callers rely on that to decide whether a message may
/// be committed.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    /// Fetch up to `max` messages (pending redeliveries first). May return an empty batch.
    async fn receive(&self, max: usize) -> Result<Vec<InboundMessage>, Self::Error>;

    /// Commit messages that reached a terminal state.
    async fn acknowledge(&self, ids: &[MessageId]) -> Result<(), Self::Error>;

    /// Publish a record and wait for the transport's acknowledgement.
    async fn publish(&self, record: OutboundRecord) -> Result<(), Self::Error>;
}

#[async_trait]
impl<C> MessageChannel for Arc<C>
where
    C: MessageChannel + ?Sized,
{
    type Error = C::Error;

    async fn receive(&self, max: usize) -> Result<Vec<InboundMessage>, Self::Error> {
        (**self).receive(max).await
    }

    async fn acknowledge(&self, ids: &[MessageId]) -> Result<(), Self::Error> {
        (**self).acknowledge(ids).await
    }

    async fn publish(&self, record: OutboundRecord) -> Result<(), Self::Error> {
        (**self).publish(record).await
    }
}
