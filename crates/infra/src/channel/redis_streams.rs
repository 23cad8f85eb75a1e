//! Redis Streams-backed message channel (durable, at-least-once delivery).
//!
//! - **Consumption**: `XREADGROUP` on one change stream within a consumer group
//! - **Redelivery**: every `receive` first re-reads this consumer's own pending
//!   entries (id `0`), so anything left unacknowledged comes back before new entries
//! - **Commit**: `XACK`
//! - **Publish**: `XADD` with fields `key`, `payload` and one field per header
//!
//! ## Dead-letter shards
//!
//! With `dlq_partitions > 1` a record published to `D` lands on stream
//! `D:{n}` where `n = fnv1a(key) % dlq_partitions`, so every record for one
//! key stays on one shard and keeps its order there.

use std::time::Duration;

use async_trait::async_trait;
use redis::Value;
use redis::aio::MultiplexedConnection;
use tracing::{debug, instrument, warn};

use newsrelay_core::MessageId;
use newsrelay_events::{InboundMessage, MessageChannel, OutboundRecord};

#[derive(Debug, thiserror::Error)]
pub enum RedisChannelError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Malformed stream entry: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisStreamSettings {
    pub stream_key: String,
    pub group: String,
    pub consumer: String,
    /// Longest a `receive` blocks waiting for new entries.
    pub block: Duration,
    pub dlq_partitions: u32,
}

impl RedisStreamSettings {
    pub fn new(stream_key: impl Into<String>, group: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            stream_key: stream_key.into(),
            group: group.into(),
            consumer: consumer.into(),
            block: Duration::from_millis(2000),
            dlq_partitions: 1,
        }
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn with_dlq_partitions(mut self, partitions: u32) -> Self {
        self.dlq_partitions = partitions.max(1);
        self
    }
}

#[derive(Clone)]
pub struct RedisStreamsChannel {
    conn: MultiplexedConnection,
    settings: RedisStreamSettings,
}

impl core::fmt::Debug for RedisStreamsChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsChannel")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsChannel {
    /// Connect and make sure the consumer group exists.
    pub async fn connect(
        redis_url: impl AsRef<str>,
        settings: RedisStreamSettings,
    ) -> Result<Self, RedisChannelError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisChannelError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RedisChannelError::Connection(e.to_string()))?;

        let channel = Self { conn, settings };
        channel.ensure_consumer_group().await?;
        Ok(channel)
    }

    pub fn settings(&self) -> &RedisStreamSettings {
        &self.settings
    }

    /// `XGROUP CREATE ... MKSTREAM`; an existing group is fine.
    async fn ensure_consumer_group(&self) -> Result<(), RedisChannelError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.settings.stream_key)
            .arg(&self.settings.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisChannelError::Command(format!("XGROUP CREATE failed: {}", e))),
        }
    }

    async fn read_group(&self, count: usize, id: &str, block: Option<Duration>) -> Result<ReadBatch, RedisChannelError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.settings.group)
            .arg(&self.settings.consumer)
            .arg("COUNT")
            .arg(count);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(&self.settings.stream_key).arg(id);

        let mut conn = self.conn.clone();
        let reply: Value = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisChannelError::Command(format!("XREADGROUP failed: {}", e)))?;

        parse_read_reply(reply)
    }
}

#[async_trait]
impl MessageChannel for RedisStreamsChannel {
    type Error = RedisChannelError;

    #[instrument(skip(self), fields(stream = %self.settings.stream_key), err)]
    async fn receive(&self, max: usize) -> Result<Vec<InboundMessage>, Self::Error> {
        loop {
            let pending = self.read_group(max, "0", None).await?;
            let had_trimmed = !pending.trimmed.is_empty();
            self.release_trimmed(&pending.trimmed).await?;
            if !pending.messages.is_empty() {
                debug!(count = pending.messages.len(), "redelivering pending entries");
                return Ok(pending.messages);
            }
            // Trimmed ids filled the page; reread now that they are gone.
            if !had_trimmed {
                break;
            }
        }

        let fresh = self.read_group(max, ">", Some(self.settings.block)).await?;
        self.release_trimmed(&fresh.trimmed).await?;
        Ok(fresh.messages)
    }

    #[instrument(skip(self, ids), fields(stream = %self.settings.stream_key, count = ids.len()), err)]
    async fn acknowledge(&self, ids: &[MessageId]) -> Result<(), Self::Error> {
        if ids.is_empty() {
            return Ok(());
        }

        let raw: Vec<&str> = ids.iter().map(MessageId::as_str).collect();
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("XACK")
            .arg(&self.settings.stream_key)
            .arg(&self.settings.group)
            .arg(&raw[..])
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisChannelError::Command(format!("XACK failed: {}", e)))?;
        Ok(())
    }

    #[instrument(skip(self, record), fields(destination = %record.destination, key = %record.key), err)]
    async fn publish(&self, record: OutboundRecord) -> Result<(), Self::Error> {
        let stream = partition_stream(&record.destination, &record.key, self.settings.dlq_partitions);

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&stream)
            .arg("*")
            .arg("key")
            .arg(&record.key)
            .arg("payload")
            .arg(&record.payload[..]);
        for (name, value) in &record.headers {
            cmd.arg(name).arg(value);
        }

        let mut conn = self.conn.clone();
        let _: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisChannelError::Command(format!("XADD to {} failed: {}", stream, e)))?;
        Ok(())
    }
}

impl RedisStreamsChannel {
    /// Acknowledge pending ids whose entries were trimmed from the stream.
    async fn release_trimmed(&self, trimmed: &[MessageId]) -> Result<(), RedisChannelError> {
        if trimmed.is_empty() {
            return Ok(());
        }
        warn!(
            count = trimmed.len(),
            ids = ?trimmed.iter().map(MessageId::as_str).collect::<Vec<_>>(),
            "pending entries were trimmed from the stream; acknowledging them"
        );
        self.acknowledge(trimmed).await
    }
}

/// One parsed `XREADGROUP` reply.
#[derive(Debug, Default)]
struct ReadBatch {
    messages: Vec<InboundMessage>,
    /// Pending ids whose body no longer exists (`[id, nil]`).
    trimmed: Vec<MessageId>,
}

enum Entry {
    Message(InboundMessage),
    Trimmed(MessageId),
}

/// Stream a record for `key` is published to.
pub fn partition_stream(destination: &str, key: &str, partitions: u32) -> String {
    if partitions <= 1 {
        return destination.to_string();
    }
    format!("{}:{}", destination, fnv1a(key.as_bytes()) % partitions)
}

fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5u32, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(0x0100_0193)
    })
}

/// Parse an `XREADGROUP` reply: `nil` or `[[stream, [[id, [field, value, ...]], ...]], ...]`.
///
/// Entries whose body was trimmed from the stream (`[id, nil]`) are reported
/// separately so the caller can acknowledge them.
fn parse_read_reply(reply: Value) -> Result<ReadBatch, RedisChannelError> {
    let streams = match reply {
        Value::Nil => return Ok(ReadBatch::default()),
        Value::Bulk(streams) => streams,
        other => return Err(RedisChannelError::Malformed(format!("unexpected reply {:?}", other))),
    };

    let mut batch = ReadBatch::default();
    for stream in streams {
        let Value::Bulk(mut parts) = stream else {
            return Err(RedisChannelError::Malformed("stream entry is not an array".into()));
        };
        if parts.len() != 2 {
            return Err(RedisChannelError::Malformed("stream entry must be [name, entries]".into()));
        }
        let entries = match parts.pop() {
            Some(Value::Bulk(entries)) => entries,
            Some(Value::Nil) | None => continue,
            Some(other) => return Err(RedisChannelError::Malformed(format!("unexpected entries {:?}", other))),
        };

        for entry in entries {
            match parse_entry(entry)? {
                Entry::Message(message) => batch.messages.push(message),
                Entry::Trimmed(id) => batch.trimmed.push(id),
            }
        }
    }
    Ok(batch)
}

fn parse_entry(entry: Value) -> Result<Entry, RedisChannelError> {
    let Value::Bulk(entry) = entry else {
        return Err(RedisChannelError::Malformed("entry is not an array".into()));
    };
    let mut entry = entry.into_iter();

    let id = match entry.next() {
        Some(Value::Data(id)) => String::from_utf8_lossy(&id).to_string(),
        _ => return Err(RedisChannelError::Malformed("missing entry id".into())),
    };
    let id = MessageId::new(id).map_err(|e| RedisChannelError::Malformed(e.to_string()))?;

    let fields = match entry.next() {
        Some(Value::Bulk(fields)) => fields,
        Some(Value::Nil) | None => return Ok(Entry::Trimmed(id)),
        Some(other) => return Err(RedisChannelError::Malformed(format!("unexpected fields {:?}", other))),
    };

    let mut key = None;
    let mut payload = None;
    for pair in fields.chunks(2) {
        if let [Value::Data(name), Value::Data(value)] = pair {
            match name.as_slice() {
                b"key" => key = Some(String::from_utf8_lossy(value).to_string()),
                b"payload" => payload = Some(value.clone()),
                _ => {}
            }
        }
    }

    // A missing payload is passed on as empty bytes; the decoder rejects it
    // and the consumer dead-letters it like any undecodable message.
    Ok(Entry::Message(InboundMessage::new(id, key, payload.unwrap_or_default())))
}
