//! Message channel adapters.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisChannelError, RedisStreamSettings, RedisStreamsChannel, partition_stream};
