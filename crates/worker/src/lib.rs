//! Process entry points: the daily collection run and the CDC relay workers.

pub mod cli;
pub mod runtime;
