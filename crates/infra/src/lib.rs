//! Infrastructure layer: resilience primitives, stores, sources, channels,
//! pipelines and the worker that runs them.

pub mod channel;
pub mod config;
pub mod dead_letter;
pub mod pipelines;
pub mod registry;
pub mod resilience;
pub mod source;
pub mod staleness;
pub mod store;
pub mod workers;


pub use config::{ConfigError, ConsumerConfig, RelayConfig, RelayStreamConfig, SourceConfig};
pub use dead_letter::{DeadLetterPublishFailure, DeadLetterPublisher};
pub use registry::{Capability, OperationRegistry, UnsupportedOperation};
pub use staleness::StalenessGuard;
