//! In-memory message channel for tests/dev.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;

use newsrelay_core::MessageId;

use crate::channel::{InboundMessage, MessageChannel, OutboundRecord};

#[derive(Debug, Error)]
pub enum InMemoryChannelError {
    /// Internal lock poisoning.
    #[error("in-memory channel lock poisoned")]
    Poisoned,

    /// Publishing was switched off with [`InMemoryChannel::reject_publishes`].
    #[error("publish rejected")]
    PublishRejected,
}

/// In-memory channel.
///
/// - No IO
/// - Received messages stay in flight until acknowledged
/// - [`InMemoryChannel::redeliver_unacknowledged`] simulates a consumer restart
#[derive(Debug, Default)]
pub struct InMemoryChannel {
    pending: Mutex<VecDeque<InboundMessage>>,
    in_flight: Mutex<Vec<InboundMessage>>,
    acknowledged: Mutex<Vec<MessageId>>,
    published: Mutex<Vec<OutboundRecord>>,
    reject_publishes: AtomicBool,
    next_id: AtomicU64,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message for delivery; returns the id it was assigned.
    pub fn push(&self, key: Option<&str>, payload: impl Into<Vec<u8>>) -> MessageId {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = MessageId::sequence("mem", n);
        let message = InboundMessage::new(id.clone(), key.map(str::to_string), payload);
        if let Ok(mut pending) = self.pending.lock() {
            pending.push_back(message);
        }
        id
    }

    /// Make every subsequent `publish()` fail (or succeed again).
    pub fn reject_publishes(&self, reject: bool) {
        self.reject_publishes.store(reject, Ordering::SeqCst);
    }

    /// Move delivered-but-unacknowledged messages back to the front of the queue.
    pub fn redeliver_unacknowledged(&self) {
        let (Ok(mut pending), Ok(mut in_flight)) = (self.pending.lock(), self.in_flight.lock())
        else {
            return;
        };
        for message in in_flight.drain(..).rev() {
            pending.push_front(message);
        }
    }

    pub fn published(&self) -> Vec<OutboundRecord> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn acknowledged(&self) -> Vec<MessageId> {
        self.acknowledged.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or_default()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().map(|p| p.len()).unwrap_or_default()
    }
}

#[async_trait]
impl MessageChannel for InMemoryChannel {
    type Error = InMemoryChannelError;

    async fn receive(&self, max: usize) -> Result<Vec<InboundMessage>, Self::Error> {
        let mut pending = self.pending.lock().map_err(|_| InMemoryChannelError::Poisoned)?;
        let mut in_flight = self.in_flight.lock().map_err(|_| InMemoryChannelError::Poisoned)?;

        let take = max.min(pending.len());
        let batch: Vec<InboundMessage> = pending.drain(..take).collect();
        in_flight.extend(batch.iter().cloned());
        Ok(batch)
    }

    async fn acknowledge(&self, ids: &[MessageId]) -> Result<(), Self::Error> {
        let mut in_flight = self.in_flight.lock().map_err(|_| InMemoryChannelError::Poisoned)?;
        let mut acknowledged = self
            .acknowledged
            .lock()
            .map_err(|_| InMemoryChannelError::Poisoned)?;

        in_flight.retain(|m| !ids.contains(&m.id));
        acknowledged.extend(ids.iter().cloned());
        Ok(())
    }

    async fn publish(&self, record: OutboundRecord) -> Result<(), Self::Error> {
        if self.reject_publishes.load(Ordering::SeqCst) {
            return Err(InMemoryChannelError::PublishRejected);
        }
        let mut published = self.published.lock().map_err(|_| InMemoryChannelError::Poisoned)?;
        published.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unacknowledged_messages_are_redelivered() {
        let channel = InMemoryChannel::new();
        let first = channel.push(Some("k1"), "one");
        let second = channel.push(None, "two");

        let batch = channel.receive(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(channel.in_flight_len(), 2);

        channel.acknowledge(&[first.clone()]).await.unwrap();
        channel.redeliver_unacknowledged();

        let again = channel.receive(10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, second);
        assert_eq!(channel.acknowledged(), vec![first]);
    }

    #[tokio::test]
    async fn receive_respects_the_batch_limit() {
        let channel = InMemoryChannel::new();
        for i in 0..5 {
            channel.push(None, format!("m{i}"));
        }

        assert_eq!(channel.receive(2).await.unwrap().len(), 2);
        assert_eq!(channel.pending_len(), 3);
    }

    #[tokio::test]
    async fn rejected_publishes_surface_as_errors() {
        let channel = InMemoryChannel::new();
        channel.reject_publishes(true);

        let record = OutboundRecord::new("dlq", "k", b"x".to_vec());
        assert!(matches!(
            channel.publish(record).await,
            Err(InMemoryChannelError::PublishRejected)
        ));
        assert!(channel.published().is_empty());
    }
}
