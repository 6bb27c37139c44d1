//! Error types for the conversion pipeline
//!
//! One enum per failure class, matching how far an error is allowed to
//! propagate:
//! - [`TemplateParseError`]: fatal at load time, stops pipeline startup
//! - [`TemplateExtractionError`]: per event, the event is skipped and counted
//! - [`ConversionError`]: per group, the group is dead-lettered
//! - [`EmissionError`]: per group, retried and then dead-lettered
//! - [`EngineStateError`]: fatal for one partition, which restarts from its checkpoint

use iomt_types::{ModelError, PartitionId};
use thiserror::Error;

/// Main processor error type
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("template parse error: {0}")]
    TemplateParse(#[from] TemplateParseError),

    #[error("template extraction error: {0}")]
    TemplateExtraction(#[from] TemplateExtractionError),

    #[error("conversion error: {0}")]
    Conversion(#[from] ConversionError),

    #[error("emission error: {0}")]
    Emission(#[from] EmissionError),

    #[error("engine state error: {0}")]
    EngineState(#[from] EngineStateError),

    #[error("window error: {0}")]
    Window(#[from] WindowError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("task failed: {0}")]
    Task(String),
}

/// Template text could not be turned into a template
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateParseError {
    #[error("template '{template}' is not valid JSON: {reason}")]
    InvalidJson { template: String, reason: String },

    #[error("template '{template}' has unknown templateType '{template_type}'")]
    UnknownTemplateType {
        template: String,
        template_type: String,
    },

    #[error("template '{template}' is missing required field '{field}'")]
    MissingField { template: String, field: String },

    #[error("template '{template}' has invalid expression '{expression}': {reason}")]
    InvalidExpression {
        template: String,
        expression: String,
        reason: String,
    },

    #[error("template '{template}' is invalid: {reason}")]
    Invalid { template: String, reason: String },
}

/// A matched event could not be turned into measurements
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateExtractionError {
    #[error("malformed payload at partition {partition} offset {offset}: {reason}")]
    MalformedPayload {
        partition: PartitionId,
        offset: i64,
        reason: String,
    },

    #[error("template '{template}' found no '{field}' at partition {partition} offset {offset}")]
    MissingField {
        template: String,
        field: String,
        partition: PartitionId,
        offset: i64,
    },

    #[error("template '{template}' could not parse timestamp '{value}' at partition {partition} offset {offset}")]
    InvalidTimestamp {
        template: String,
        value: String,
        partition: PartitionId,
        offset: i64,
    },

    #[error("template '{template}' found non-scalar '{field}' at partition {partition} offset {offset}")]
    NonScalarValue {
        template: String,
        field: String,
        partition: PartitionId,
        offset: i64,
    },
}

impl TemplateExtractionError {
    /// Template that raised the error, if any
    pub fn template(&self) -> Option<&str> {
        match self {
            TemplateExtractionError::MalformedPayload { .. } => None,
            TemplateExtractionError::MissingField { template, .. }
            | TemplateExtractionError::InvalidTimestamp { template, .. }
            | TemplateExtractionError::NonScalarValue { template, .. } => Some(template),
        }
    }
}

/// A sealed group could not be converted into resources
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error("no conversion template for measure type '{measure_type}' (group {key})")]
    NoTemplate { key: String, measure_type: String },

    #[error("group {key}: template '{template}' requires value '{value_name}' but no measurement has it")]
    MissingRequiredValue {
        key: String,
        template: String,
        value_name: String,
    },

    #[error("group {key}: template '{template}' cannot use '{value}' for '{value_name}': {reason}")]
    InvalidValue {
        key: String,
        template: String,
        value_name: String,
        value: String,
        reason: String,
    },
}

impl ConversionError {
    /// Template that raised the error, if any
    pub fn template(&self) -> Option<&str> {
        match self {
            ConversionError::NoTemplate { .. } => None,
            ConversionError::MissingRequiredValue { template, .. }
            | ConversionError::InvalidValue { template, .. } => Some(template),
        }
    }
}

/// Handing a resource to the sink failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmissionError {
    #[error("sink unavailable: {reason}")]
    SinkUnavailable { reason: String },

    #[error("sink rejected resource {id}: {reason}")]
    Rejected { id: String, reason: String },

    #[error("emission of group {key} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        key: String,
        attempts: u32,
        last_error: String,
    },

    #[error("emission queue closed")]
    QueueClosed,
}

impl EmissionError {
    /// Whether a later attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmissionError::SinkUnavailable { .. })
    }
}

/// The grouping engine found its own state inconsistent
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineStateError {
    #[error("corrupted window state for {key}: {reason}")]
    CorruptedWindow { key: String, reason: String },
}

impl From<ModelError> for EngineStateError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::InvalidGroup { key, reason } => EngineStateError::CorruptedWindow { key, reason },
        }
    }
}

/// Window assignment errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
    #[error("invalid window size: {size}ms, must be greater than 0")]
    InvalidWindowSize { size: i64 },

    #[error("invalid event timestamp: {timestamp}, reason: {reason}")]
    InvalidTimestamp { timestamp: i64, reason: String },
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failures of the external collaborators
#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("event source error on partition {partition}: {reason}")]
    EventSource { partition: PartitionId, reason: String },

    #[error("template '{name}' version '{version}' unavailable: {reason}")]
    TemplateStore {
        name: String,
        version: String,
        reason: String,
    },

    #[error("dead-letter queue error: {0}")]
    DeadLetter(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for processor operations
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Result type alias for template loading
pub type TemplateResult<T> = std::result::Result<T, TemplateParseError>;

/// Result type alias for template extraction
pub type ExtractionResult<T> = std::result::Result<T, TemplateExtractionError>;

/// Result type alias for conversion
pub type ConversionResult<T> = std::result::Result<T, ConversionError>;

/// Result type alias for emission
pub type EmissionResult<T> = std::result::Result<T, EmissionError>;

/// Result type alias for grouping engine operations
pub type EngineResult<T> = std::result::Result<T, EngineStateError>;

/// Result type alias for window operations
pub type WindowResult<T> = std::result::Result<T, WindowError>;

/// Result type alias for collaborator operations
pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;

impl From<serde_json::Error> for ProcessorError {
    fn from(err: serde_json::Error) -> Self {
        ProcessorError::Serialization(err.to_string())
    }
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(err.to_string())
    }
}
