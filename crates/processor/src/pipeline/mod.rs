//! Conversion pipeline
//!
//! Wires the three stages to their collaborators:
//! - [`PipelineBuilder`]: assembles templates, source, sink and dead-letter queue
//! - [`Pipeline`]: runs one worker per partition plus the emitter
//! - [`PartitionStats`] / [`PipelineStats`]: what a run reports

pub mod builder;
pub mod executor;
mod worker;

pub use builder::PipelineBuilder;
pub use executor::{Pipeline, PipelineStats};
pub use worker::PartitionStats;
