//! Change events and the channels they travel on.
//!
//! - [`envelope`]: CDC envelope wire shape + decoder
//! - [`channel`]: message channel abstraction (deliver / acknowledge / publish)
//! - [`in_memory_channel`]: channel for tests/dev
//! - [`dead_letter`]: dead-letter record and its wire header

pub mod channel;
pub mod dead_letter;
pub mod envelope;
pub mod in_memory_channel;

pub use channel::{InboundMessage, MessageChannel, OutboundRecord};
pub use dead_letter::{DeadLetterRecord, RETRY_COUNT_HEADER};
pub use envelope::{ChangeEnvelope, DecodeError, Decoded, Operation, SourceInfo};
pub use in_memory_channel::{InMemoryChannel, InMemoryChannelError};
