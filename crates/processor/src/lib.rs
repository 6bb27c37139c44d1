//! Stream processor converting device telemetry into clinical observations
//!
//! Raw events flow through three stages:
//! - normalization: device content templates extract [`Measurement`]s
//! - grouping: measurements are aggregated per key in watermark-sealed
//!   tumbling windows
//! - conversion: each sealed group becomes FHIR `Observation` resources with
//!   deterministic identifiers, upserted into the sink
//!
//! [`pipeline::Pipeline`] runs the stages per partition against the
//! collaborator traits in [`collaborators`].
//!
//! [`Measurement`]: iomt_types::Measurement

pub mod collaborators;
pub mod config;
pub mod conversion;
pub mod dead_letter;
pub mod emission;
pub mod error;
pub mod grouping;
pub mod normalization;
pub mod pipeline;
pub mod telemetry;
pub mod template;
pub mod watermark;
pub mod window;

// Re-export commonly used types
pub use collaborators::{EventSource, ResourceSink, TemplateStore};

pub use config::{
    ConversionConfig, DeadLetterConfig, DeadLetterKind, EmissionConfig, LatePolicy, LoggingConfig,
    NormalizationConfig, ProcessorConfig, UnmappedPolicy, WindowConfig,
};

pub use conversion::{ConversionTemplateCollection, Converter, ResourceId};

pub use dead_letter::{DeadLetterEntry, DeadLetterQueue, FailureKind};

pub use emission::{EmissionQueue, Emitter};

pub use error::{
    CollaboratorError, ConfigError, ConversionError, EmissionError, EngineStateError, ProcessorError,
    Result as ProcessorResult, TemplateExtractionError, TemplateParseError, WindowError,
};

pub use grouping::{EngineStats, GroupingEngine, IngestOutcome};

pub use normalization::{NormalizationOutcome, Normalizer};

pub use pipeline::{Pipeline, PipelineBuilder, PipelineStats};

pub use telemetry::{init_tracing, BatchTelemetry};

pub use template::{ContentTemplate, TemplateCollection, TemplateRegistry, TemplateSource};

pub use watermark::Watermark;

pub use window::{TumblingWindowAssigner, WindowAssigner, WindowBounds};
