//! Pipeline builder for fluent API configuration

use super::executor::Pipeline;
use crate::collaborators::{EventSource, ResourceSink};
use crate::config::ProcessorConfig;
use crate::conversion::{ConversionTemplateCollection, Converter};
use crate::dead_letter::{self, DeadLetterQueue};
use crate::error::{ConfigError, Result};
use crate::grouping::GroupingEngine;
use crate::normalization::Normalizer;
use crate::template::TemplateCollection;
use std::sync::Arc;

/// Builder wiring templates and collaborators into a [`Pipeline`]
///
/// # Example
///
/// ```rust,no_run
/// use iomt_processor::collaborators::{MemoryEventSource, MemoryResourceSink, MemoryTemplateStore, load_templates};
/// use iomt_processor::config::ProcessorConfig;
/// use iomt_processor::pipeline::PipelineBuilder;
/// use iomt_processor::template::{TemplateRegistry, TemplateSource};
/// use std::sync::Arc;
///
/// # async fn example() -> anyhow::Result<()> {
/// let store = MemoryTemplateStore::new();
/// let (device, fhir) = load_templates(
///     &store,
///     &TemplateRegistry::default(),
///     &TemplateSource::new("devicecontent", "1"),
///     &TemplateSource::new("fhirmapping", "1"),
/// )
/// .await?;
///
/// let pipeline = PipelineBuilder::new(ProcessorConfig::default())
///     .with_device_templates(device)
///     .with_conversion_templates(fhir)
///     .with_source(Arc::new(MemoryEventSource::default()))
///     .with_sink(Arc::new(MemoryResourceSink::new()))
///     .build()
///     .await?;
///
/// let (_stop, shutdown) = tokio::sync::watch::channel(false);
/// let stats = pipeline.run(shutdown).await?;
/// println!("{} events", stats.events());
/// # Ok(())
/// # }
/// ```
pub struct PipelineBuilder {
    config: ProcessorConfig,
    device_templates: Option<TemplateCollection>,
    conversion_templates: Option<ConversionTemplateCollection>,
    source: Option<Arc<dyn EventSource>>,
    sink: Option<Arc<dyn ResourceSink>>,
    dead_letter: Option<Arc<dyn DeadLetterQueue>>,
}

impl PipelineBuilder {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            config,
            device_templates: None,
            conversion_templates: None,
            source: None,
            sink: None,
            dead_letter: None,
        }
    }

    pub fn with_device_templates(mut self, templates: TemplateCollection) -> Self {
        self.device_templates = Some(templates);
        self
    }

    pub fn with_conversion_templates(mut self, templates: ConversionTemplateCollection) -> Self {
        self.conversion_templates = Some(templates);
        self
    }

    pub fn with_source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResourceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Use this dead-letter queue instead of the configured one
    pub fn with_dead_letter(mut self, dead_letter: Arc<dyn DeadLetterQueue>) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    /// Validate the configuration and assemble the pipeline
    pub async fn build(self) -> Result<Pipeline> {
        self.config.validate()?;

        let device_templates = self.device_templates.ok_or_else(|| missing("device templates"))?;
        let conversion_templates = self.conversion_templates.ok_or_else(|| missing("conversion templates"))?;
        let source = self.source.ok_or_else(|| missing("an event source"))?;
        let sink = self.sink.ok_or_else(|| missing("a resource sink"))?;
        let dead_letter = match self.dead_letter {
            Some(dead_letter) => dead_letter,
            None => dead_letter::from_config(&self.config.dead_letter).await?,
        };

        let normalizer = Normalizer::new(Arc::new(device_templates), self.config.normalization.clone());
        let engine = GroupingEngine::new(self.config.window.clone())?;
        let converter = Converter::new(Arc::new(conversion_templates), self.config.conversion.clone());

        Ok(Pipeline {
            config: self.config,
            normalizer: Arc::new(normalizer),
            engine: Arc::new(engine),
            converter,
            source,
            sink,
            dead_letter,
        })
    }
}

fn missing(what: &str) -> ConfigError {
    ConfigError::Invalid(format!("pipeline requires {}", what))
}
