//! Failure-handling building blocks shared by every pipeline.
//!
//! - [`retry`]: bounded exponential-backoff retry of one async operation
//! - [`batch`]: per-unit retry over a batch plus a resweep of the failures
//!
//! Both are transport- and storage-agnostic: callers hand in a closure and an
//! explicit settings value. Backoff sleeps are tokio timers, never thread sleeps.

pub mod batch;
pub mod retry;

pub use batch::{BatchFailure, BatchProcessor, BatchReport, BatchSettings};
pub use retry::{RetriesExhausted, RetrySettings, execute, execute_logged};
