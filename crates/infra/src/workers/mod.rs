//! Background workers.

pub mod cdc_worker;

pub use cdc_worker::{CdcWorker, CdcWorkerConfig, ConsumeError, WorkerHandle};
