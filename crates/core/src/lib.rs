//! `newsrelay-core`: domain building blocks shared by every pipeline.
//!
//! This crate contains **pure** primitives (no I/O, no async).

pub mod error;
pub mod id;
pub mod row;

pub use error::{DomainError, DomainResult};
pub use id::{MessageId, RowKey};
pub use row::{Row, RowIdentity, RowImage, TimestampFormat};
