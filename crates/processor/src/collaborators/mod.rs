//! External collaborators of the pipeline
//!
//! The pipeline consumes raw event batches from an [`EventSource`], template
//! text from a [`TemplateStore`], and hands finished resources plus batch
//! telemetry to a [`ResourceSink`]. Transport, credentials and storage
//! technology stay behind these traits.

pub mod sink;
pub mod source;
pub mod store;

pub use sink::MemoryResourceSink;
pub use source::MemoryEventSource;
pub use store::{load_templates, DirectoryTemplateStore, MemoryTemplateStore};

use crate::error::{CollaboratorResult, EmissionResult};
use crate::telemetry::BatchTelemetry;
use async_trait::async_trait;
use iomt_types::{ClinicalResource, PartitionId, RawEvent};

/// Partitioned stream of raw events with at-least-once delivery
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Partitions this source serves
    async fn partitions(&self) -> CollaboratorResult<Vec<PartitionId>>;

    /// Next batch of a partition in arrival order
    ///
    /// `Some(vec![])` means nothing is available right now, `None` means the
    /// partition is exhausted.
    async fn next_batch(&self, partition: PartitionId) -> CollaboratorResult<Option<Vec<RawEvent>>>;

    /// Acknowledge everything up to and including `offset`
    async fn checkpoint(&self, partition: PartitionId, offset: i64) -> CollaboratorResult<()>;

    /// Redeliver from the last checkpoint
    async fn rewind(&self, partition: PartitionId) -> CollaboratorResult<()>;
}

/// Read-only source of template text
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn fetch(&self, name: &str, version: &str) -> CollaboratorResult<String>;
}

/// Destination of synthesized resources
#[async_trait]
pub trait ResourceSink: Send + Sync {
    /// Create or replace the resource with the same type and identifier
    async fn upsert(&self, resource: &ClinicalResource) -> EmissionResult<()>;

    /// Accept the telemetry record of one batch
    async fn record_telemetry(&self, telemetry: &BatchTelemetry) -> EmissionResult<()>;
}
