//! Core types and data models for the IoMT conversion pipeline
//!
//! This crate provides the data structures that flow between the pipeline
//! stages: raw device events, normalized measurements, sealed measurement
//! groups and the clinical resources synthesized from them.

pub mod errors;
pub mod events;
pub mod measurements;
pub mod resources;

pub use errors::{ModelError, Result};
pub use events::{PartitionId, PropertyValue, RawEvent, SystemProperties};
pub use measurements::{GroupKey, Measurement, MeasurementGroup, MeasurementProperty};
pub use resources::ClinicalResource;
