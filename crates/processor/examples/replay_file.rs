//! Replay recorded device events through the pipeline
//!
//! Reads templates from a directory laid out as `<dir>/<name>/<version>.json`
//! and events from a JSON-lines file, one event per line:
//!
//! ```text
//! {"partition": 0, "offset": 12, "enqueuedTime": "2024-01-01T00:00:10Z",
//!  "properties": {"eventType": "vitals"}, "body": {"heartRate": 72, ...}}
//! ```
//!
//! Converted resources are printed as JSON lines.
//!
//! Run with: cargo run --example replay_file -- <template-dir> <events.jsonl> [config.yaml]

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use iomt_processor::collaborators::{load_templates, DirectoryTemplateStore, MemoryEventSource, MemoryResourceSink};
use iomt_processor::config::ProcessorConfig;
use iomt_processor::pipeline::PipelineBuilder;
use iomt_processor::telemetry::init_tracing;
use iomt_processor::template::{TemplateRegistry, TemplateSource};
use iomt_types::{PartitionId, PropertyValue, RawEvent, SystemProperties};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordedEvent {
    #[serde(default)]
    partition: PartitionId,
    offset: i64,
    enqueued_time: DateTime<Utc>,
    #[serde(default)]
    properties: BTreeMap<String, serde_json::Value>,
    body: serde_json::Value,
}

impl RecordedEvent {
    fn into_raw(self) -> anyhow::Result<RawEvent> {
        let payload = serde_json::to_vec(&self.body)?;
        let mut event = RawEvent::new(
            self.partition,
            payload,
            SystemProperties::new(self.offset, self.offset, self.enqueued_time),
        );
        for (name, value) in self.properties {
            let value = match value {
                serde_json::Value::String(s) => PropertyValue::from(s),
                serde_json::Value::Bool(b) => PropertyValue::from(b),
                serde_json::Value::Number(n) => match n.as_i64() {
                    Some(i) => PropertyValue::from(i),
                    None => PropertyValue::from(n.as_f64().unwrap_or_default()),
                },
                other => PropertyValue::from(other.to_string()),
            };
            event = event.with_property(name, value);
        }
        Ok(event)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 {
        bail!("usage: replay_file <template-dir> <events.jsonl> [config.yaml]");
    }
    let template_dir = PathBuf::from(&args[0]);
    let events_path = PathBuf::from(&args[1]);
    let config_path = args.get(2).map(PathBuf::from);

    let config = ProcessorConfig::load(config_path.as_deref()).context("loading configuration")?;
    init_tracing(&config.logging)?;

    let store = DirectoryTemplateStore::new(&template_dir);
    let (device, fhir) = load_templates(
        &store,
        &TemplateRegistry::default(),
        &TemplateSource::new("devicecontent", "1"),
        &TemplateSource::new("fhirmapping", "1"),
    )
    .await
    .with_context(|| format!("loading templates from {}", template_dir.display()))?;

    let text = tokio::fs::read_to_string(&events_path)
        .await
        .with_context(|| format!("reading {}", events_path.display()))?;
    let mut events = Vec::new();
    for (line_no, line) in text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
        let recorded: RecordedEvent =
            serde_json::from_str(line).with_context(|| format!("line {}", line_no + 1))?;
        events.push(recorded.into_raw()?);
    }

    let source = Arc::new(MemoryEventSource::default());
    source.append(events).await;
    let sink = Arc::new(MemoryResourceSink::new());

    let pipeline = PipelineBuilder::new(config)
        .with_device_templates(device)
        .with_conversion_templates(fhir)
        .with_source(source)
        .with_sink(sink.clone())
        .build()
        .await?;

    let (_stop, shutdown) = watch::channel(false);
    let stats = pipeline.run(shutdown).await?;

    for resource in sink.resources() {
        println!("{}", serde_json::to_string(&resource.payload)?);
    }

    eprintln!(
        "{} events, {} resources, {} dead-lettered groups, {:.1} events/s",
        stats.events(),
        sink.len(),
        stats.emission.counters.dead_lettered_groups,
        stats.events_per_second()
    );

    Ok(())
}
