//! Integration tests for the conversion pipeline
//!
//! Test Coverage:
//! - Normalization of mixed batches (matched, unmapped, failing events)
//! - Window grouping, boundaries and late data under both policies
//! - Deterministic conversion and idempotent upserts
//! - End-to-end runs: checkpoints, telemetry, shutdown flush, retries and
//!   dead-lettering

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use iomt_processor::collaborators::{
    load_templates, EventSource, MemoryEventSource, MemoryResourceSink, MemoryTemplateStore, ResourceSink,
};
use iomt_processor::config::{EmissionConfig, LatePolicy, NormalizationConfig, ProcessorConfig, WindowConfig};
use iomt_processor::conversion::{ConversionTemplateCollection, Converter};
use iomt_processor::dead_letter::{DeadLetterItem, DeadLetterQueue, FailureKind, MemoryDeadLetterQueue};
use iomt_processor::error::{CollaboratorResult, EmissionError, EmissionResult};
use iomt_processor::grouping::GroupingEngine;
use iomt_processor::normalization::Normalizer;
use iomt_processor::pipeline::PipelineBuilder;
use iomt_processor::telemetry::BatchTelemetry;
use iomt_processor::template::{TemplateCollection, TemplateRegistry, TemplateSource};
use iomt_types::{ClinicalResource, Measurement, PartitionId, RawEvent, SystemProperties};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// FIXTURES
// ============================================================================

/// `at(0)` is aligned to a minute
fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_040 + secs, 0).unwrap()
}

fn device_template_text() -> String {
    json!({
        "templateType": "CollectionContent",
        "template": [{
            "templateType": "JsonPathContent",
            "template": {
                "typeName": "HeartRate",
                "typeMatchExpression": "$..[?(@heartRate)]",
                "deviceIdExpression": "$.deviceId",
                "patientIdExpression": "$.patientId",
                "timestampExpression": "$.endDate",
                "values": [{"valueName": "hr", "valueExpression": "$.heartRate", "required": true}]
            }
        }]
    })
    .to_string()
}

fn fhir_template_text() -> String {
    json!({
        "templateType": "CollectionFhir",
        "template": [{
            "templateType": "CodeValueFhir",
            "template": {
                "typeName": "HeartRate",
                "codes": [{"code": "8867-4", "system": "http://loinc.org", "display": "Heart rate"}],
                "value": {"valueName": "hr", "valueType": "SampledData", "defaultPeriod": 10000, "unit": "count/min"}
            }
        }]
    })
    .to_string()
}

fn device_templates() -> TemplateCollection {
    TemplateRegistry::default()
        .load(TemplateSource::new("devicecontent", "1"), &device_template_text())
        .unwrap()
}

fn conversion_templates() -> ConversionTemplateCollection {
    ConversionTemplateCollection::load(TemplateSource::new("fhirmapping", "1"), &fhir_template_text()).unwrap()
}

fn raw_event(partition: PartitionId, offset: i64, payload: Value) -> RawEvent {
    RawEvent::new(
        partition,
        serde_json::to_vec(&payload).unwrap(),
        SystemProperties::new(offset, offset, Utc::now()),
    )
    .with_property("eventType", "vitals")
}

fn heart_rate_event(partition: PartitionId, offset: i64, device: &str, secs: i64, hr: i64) -> RawEvent {
    raw_event(
        partition,
        offset,
        json!({
            "heartRate": hr,
            "deviceId": device,
            "patientId": format!("patient-of-{}", device),
            "endDate": at(secs).to_rfc3339(),
        }),
    )
}

fn heart_rate(device: &str, secs: i64, hr: &str) -> Measurement {
    Measurement::new("HeartRate", device, at(secs))
        .with_patient_id(Some(format!("patient-of-{}", device)))
        .with_property("hr", hr)
}

fn fast_emission() -> EmissionConfig {
    EmissionConfig {
        queue_capacity: 8,
        max_retries: 2,
        base_backoff_ms: 1,
        max_backoff_ms: 2,
    }
}

fn config(window: WindowConfig) -> ProcessorConfig {
    ProcessorConfig {
        window,
        emission: fast_emission(),
        ..Default::default()
    }
}

// ============================================================================
// NORMALIZATION
// ============================================================================

mod normalization_tests {
    use super::*;

    fn normalizer() -> Normalizer {
        Normalizer::new(Arc::new(device_templates()), NormalizationConfig::default())
    }

    #[test]
    fn test_failing_event_does_not_abort_batch() {
        let batch = vec![
            heart_rate_event(0, 1, "dev-1", 10, 72),
            raw_event(0, 2, json!({"heartRate": 80, "endDate": at(20).to_rfc3339()})),
            heart_rate_event(0, 3, "dev-1", 30, 74),
        ];

        let outcome = normalizer().normalize(&batch);

        assert_eq!(outcome.measurements.len(), 2);
        assert_eq!(outcome.error_count(), 1);
        assert_eq!(outcome.failures[0].event.offset(), 2);
        assert_eq!(outcome.matched_count(), 2);
    }

    #[test]
    fn test_payload_without_expected_field_is_unmapped() {
        let outcome = normalizer().normalize(&[raw_event(0, 1, json!({"hr": 72}))]);

        assert!(outcome.measurements.is_empty());
        assert_eq!(outcome.unmapped_count(), 1);
        assert_eq!(outcome.error_count(), 0);
        assert!(outcome.dead_letter_entries().is_empty());
    }

    #[test]
    fn test_occurrence_time_comes_from_event() {
        let outcome = normalizer().normalize(&[heart_rate_event(0, 1, "dev-1", 17, 72)]);

        let measurement = &outcome.measurements[0];
        assert_eq!(measurement.measure_type(), "HeartRate");
        assert_eq!(measurement.occurrence_time_utc(), at(17));
    }

    #[test]
    fn test_bytes_counted_once_per_event() {
        let event = heart_rate_event(0, 1, "dev-1", 10, 72);
        let size = event.size_bytes();

        let outcome = normalizer().normalize(&[event]);
        assert_eq!(outcome.counters["vitals"].bytes, size);
        assert_eq!(outcome.counters["vitals"].events, 1);
    }
}

// ============================================================================
// GROUPING
// ============================================================================

mod grouping_tests {
    use super::*;

    #[test]
    fn test_sixty_second_window_scenario() {
        let engine = GroupingEngine::new(WindowConfig::tumbling(60_000, 5_000)).unwrap();

        let first = engine
            .ingest(0, vec![heart_rate("dev-1", 10, "72"), heart_rate("dev-1", 50, "75")])
            .unwrap();
        assert!(first.sealed.is_empty());

        // watermark reaches 61s
        let second = engine.ingest(0, vec![heart_rate("dev-1", 66, "80")]).unwrap();
        assert_eq!(second.sealed.len(), 1);

        let group = &second.sealed[0];
        assert_eq!(group.window_start(), at(0));
        assert_eq!(group.window_end(), at(60));
        assert_eq!(group.len(), 2);
    }

    #[test]
    fn test_window_end_belongs_to_next_window() {
        let engine = GroupingEngine::new(WindowConfig::tumbling(60_000, 0)).unwrap();

        let outcome = engine
            .ingest(0, vec![heart_rate("dev-1", 30, "72"), heart_rate("dev-1", 60, "75")])
            .unwrap();

        assert_eq!(outcome.sealed.len(), 1);
        assert_eq!(outcome.sealed[0].len(), 1);
        assert_eq!(outcome.sealed[0].measurements()[0].occurrence_time_utc(), at(30));

        let rest = engine.flush_all().unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].window_start(), at(60));
    }

    #[test]
    fn test_late_measurement_is_dropped_not_misrouted() {
        let engine = GroupingEngine::new(WindowConfig::tumbling(60_000, 5_000)).unwrap();

        engine.ingest(0, vec![heart_rate("dev-1", 10, "72")]).unwrap();
        engine.ingest(0, vec![heart_rate("dev-2", 70, "60")]).unwrap();

        let late = engine.ingest(0, vec![heart_rate("dev-1", 20, "99")]).unwrap();
        assert_eq!(late.counters.late_dropped, 1);
        assert!(late.sealed.is_empty());

        let rest = engine.flush_all().unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].key().device_id, "dev-2");
        assert!(rest[0].measurements().iter().all(|m| m.property("hr") != Some("99")));
    }

    #[test]
    fn test_reopened_window_keeps_identifier() {
        let engine = GroupingEngine::new(
            WindowConfig::tumbling(60_000, 5_000)
                .with_late_policy(LatePolicy::Reopen)
                .with_late_retention(120_000),
        )
        .unwrap();
        let converter = Converter::new(Arc::new(conversion_templates()), Default::default());

        let sealed = engine
            .ingest(0, vec![heart_rate("dev-1", 10, "72"), heart_rate("dev-1", 70, "80")])
            .unwrap()
            .sealed;
        assert_eq!(sealed.len(), 1);
        let original = converter.convert(&sealed[0]).unwrap();

        // the watermark is already past the window, so it seals again at once
        let reopened = engine.ingest(0, vec![heart_rate("dev-1", 20, "74")]).unwrap();
        assert_eq!(reopened.counters.reopened_groups, 1);
        assert_eq!(reopened.sealed.len(), 1);

        let revised_group = &reopened.sealed[0];
        assert_eq!(revised_group.window_start(), at(0));
        assert_eq!(revised_group.revision(), 1);
        assert_eq!(revised_group.len(), 2);

        let updated = converter.convert(revised_group).unwrap();
        assert_eq!(original[0].id, updated[0].id);
        assert_ne!(original[0].payload, updated[0].payload);
    }

    #[test]
    fn test_group_is_ordered_by_occurrence() {
        let engine = GroupingEngine::new(WindowConfig::tumbling(60_000, 30_000)).unwrap();

        engine
            .ingest(0, vec![heart_rate("dev-1", 40, "2"), heart_rate("dev-1", 20, "1")])
            .unwrap();
        let groups = engine.flush_all().unwrap();

        let order: Vec<_> = groups[0].measurements().iter().map(|m| m.property("hr")).collect();
        assert_eq!(order, vec![Some("1"), Some("2")]);
    }
}

// ============================================================================
// CONVERSION
// ============================================================================

mod conversion_tests {
    use super::*;

    #[test]
    fn test_conversion_is_idempotent() {
        let engine = GroupingEngine::new(WindowConfig::tumbling(60_000, 0)).unwrap();
        engine
            .ingest(0, vec![heart_rate("dev-1", 10, "72"), heart_rate("dev-1", 20, "74")])
            .unwrap();
        let groups = engine.flush_all().unwrap();
        let converter = Converter::new(Arc::new(conversion_templates()), Default::default());

        let first = converter.convert(&groups[0]).unwrap();
        let second = converter.convert(&groups[0]).unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].payload["subject"]["reference"], "Patient/patient-of-dev-1");
    }
}

// ============================================================================
// END-TO-END
// ============================================================================

mod end_to_end_tests {
    use super::*;

    /// Keeps returning empty batches once the inner source is exhausted
    struct EndlessSource(MemoryEventSource);

    #[async_trait]
    impl EventSource for EndlessSource {
        async fn partitions(&self) -> CollaboratorResult<Vec<PartitionId>> {
            self.0.partitions().await
        }

        async fn next_batch(&self, partition: PartitionId) -> CollaboratorResult<Option<Vec<RawEvent>>> {
            Ok(Some(self.0.next_batch(partition).await?.unwrap_or_default()))
        }

        async fn checkpoint(&self, partition: PartitionId, offset: i64) -> CollaboratorResult<()> {
            self.0.checkpoint(partition, offset).await
        }

        async fn rewind(&self, partition: PartitionId) -> CollaboratorResult<()> {
            self.0.rewind(partition).await
        }
    }

    /// Sink that is never reachable
    #[derive(Default)]
    struct UnavailableSink {
        telemetry: MemoryResourceSink,
    }

    #[async_trait]
    impl ResourceSink for UnavailableSink {
        async fn upsert(&self, _resource: &ClinicalResource) -> EmissionResult<()> {
            Err(EmissionError::SinkUnavailable {
                reason: "connection refused".to_string(),
            })
        }

        async fn record_telemetry(&self, telemetry: &BatchTelemetry) -> EmissionResult<()> {
            self.telemetry.record_telemetry(telemetry).await
        }
    }

    fn sum(records: &[BatchTelemetry], field: impl Fn(&BatchTelemetry) -> u64) -> u64 {
        records.iter().map(field).sum()
    }

    #[tokio::test]
    async fn test_replay_two_partitions() {
        let source = Arc::new(MemoryEventSource::new(10));
        source
            .append(vec![
                heart_rate_event(0, 0, "dev-1", 10, 72),
                heart_rate_event(0, 1, "dev-1", 50, 75),
                heart_rate_event(0, 2, "dev-1", 130, 80),
                heart_rate_event(1, 0, "dev-2", 15, 90),
                raw_event(1, 1, json!({"hr": 1})),
                raw_event(1, 2, json!({"heartRate": 1, "endDate": at(16).to_rfc3339()})),
            ])
            .await;

        let store = MemoryTemplateStore::new();
        store.insert("devicecontent", "1", device_template_text());
        store.insert("fhirmapping", "1", fhir_template_text());
        let (device, fhir) = load_templates(
            &store,
            &TemplateRegistry::default(),
            &TemplateSource::new("devicecontent", "1"),
            &TemplateSource::new("fhirmapping", "1"),
        )
        .await
        .unwrap();

        let sink = Arc::new(MemoryResourceSink::new());
        let dlq = Arc::new(MemoryDeadLetterQueue::new());
        let pipeline = PipelineBuilder::new(config(WindowConfig::tumbling(60_000, 5_000)))
            .with_device_templates(device)
            .with_conversion_templates(fhir)
            .with_source(source.clone())
            .with_sink(sink.clone())
            .with_dead_letter(dlq.clone())
            .build()
            .await
            .unwrap();

        let (_stop, shutdown) = watch::channel(false);
        let stats = pipeline.run(shutdown).await.unwrap();

        // dev-1: one window sealed by the watermark, one by the flush; dev-2 flushed
        assert_eq!(sink.len(), 3);
        assert_eq!(stats.events(), 6);
        assert_eq!(stats.partitions[&0].last_checkpoint, Some(2));
        assert_eq!(stats.partitions[&1].errored_events, 1);
        assert_eq!(stats.partitions[&1].unmapped_events, 1);
        assert_eq!(stats.flushed_groups, 2);
        assert_eq!(stats.emission.counters.upserted_resources, 3);
        assert_eq!(stats.engine.tracked_keys, 0);
        assert_eq!(source.committed(1).await, Some(2));

        let entries = dlq.list(0, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].failure_kind, FailureKind::Extraction);
        assert_eq!(entries[0].origin(), "partition 1 offset 2");

        let records = sink.telemetry().await;
        assert_eq!(sum(&records, |r| r.events), 6);
        assert_eq!(sum(&records, |r| r.sealed_groups), 3);
        assert_eq!(sum(&records, |r| r.upserted_resources), 3);
        assert_eq!(sum(&records, |r| r.unmapped_events), 1);
        assert_eq!(sum(&records, |r| r.errored_events), 1);
        assert!(records.iter().filter(|r| r.events > 0).all(|r| r.bytes > 0));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_open_windows() {
        let inner = MemoryEventSource::new(10);
        inner.append(vec![heart_rate_event(0, 0, "dev-1", 10, 72)]).await;

        let sink = Arc::new(MemoryResourceSink::new());
        let pipeline = Arc::new(
            PipelineBuilder::new(config(WindowConfig::tumbling(60_000, 5_000)))
                .with_device_templates(device_templates())
                .with_conversion_templates(conversion_templates())
                .with_source(Arc::new(EndlessSource(inner)))
                .with_sink(sink.clone())
                .build()
                .await
                .unwrap(),
        );

        let (stop, shutdown) = watch::channel(false);
        let running = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.run(shutdown).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.telemetry().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(sink.is_empty());

        stop.send(true).unwrap();
        let stats = running.await.unwrap().unwrap();

        assert_eq!(stats.flushed_groups, 1);
        assert_eq!(sink.len(), 1);
        let resource = &sink.resources()[0];
        assert_eq!(resource.payload["device"]["reference"], "Device/dev-1");
    }

    #[tokio::test]
    async fn test_unavailable_sink_dead_letters_groups() {
        let source = Arc::new(MemoryEventSource::new(10));
        source.append(vec![heart_rate_event(0, 0, "dev-1", 10, 72)]).await;

        let sink = Arc::new(UnavailableSink::default());
        let dlq = Arc::new(MemoryDeadLetterQueue::new());
        let pipeline = PipelineBuilder::new(config(WindowConfig::tumbling(60_000, 5_000)))
            .with_device_templates(device_templates())
            .with_conversion_templates(conversion_templates())
            .with_source(source)
            .with_sink(sink.clone())
            .with_dead_letter(dlq.clone())
            .build()
            .await
            .unwrap();

        let (_stop, shutdown) = watch::channel(false);
        let stats = pipeline.run(shutdown).await.unwrap();

        assert_eq!(stats.emission.counters.failed_emissions, 1);
        assert_eq!(stats.emission.counters.emission_retries, 2);

        let entries = dlq.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].failure_kind, FailureKind::Emission);
        assert_eq!(entries[0].retry_count, 3);
        match &entries[0].item {
            DeadLetterItem::Group(group) => {
                assert_eq!(group.key().device_id, "dev-1");
                assert_eq!(group.window_start(), at(0));
            }
            other => panic!("expected a group, got {:?}", other),
        }

        let records = sink.telemetry.telemetry().await;
        assert_eq!(sum(&records, |r| r.dead_lettered_groups), 1);
    }

    #[tokio::test]
    async fn test_reprocessing_upserts_same_resources() {
        let events: Vec<RawEvent> = (0..4).map(|i| heart_rate_event(0, i, "dev-1", i * 20, 70 + i)).collect();
        let sink = Arc::new(MemoryResourceSink::new());

        for _ in 0..2 {
            let source = Arc::new(MemoryEventSource::new(2));
            source.append(events.clone()).await;
            let pipeline = PipelineBuilder::new(config(WindowConfig::tumbling(60_000, 5_000)))
                .with_device_templates(device_templates())
                .with_conversion_templates(conversion_templates())
                .with_source(source)
                .with_sink(sink.clone())
                .build()
                .await
                .unwrap();
            let (_stop, shutdown) = watch::channel(false);
            pipeline.run(shutdown).await.unwrap();
        }

        // [0s, 60s) and [60s, 120s), each upserted once per run
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.upsert_count(), 4);
    }

    #[tokio::test]
    async fn test_missing_collaborator_is_rejected() {
        let result = PipelineBuilder::new(ProcessorConfig::default())
            .with_device_templates(device_templates())
            .with_conversion_templates(conversion_templates())
            .build()
            .await;
        assert!(result.is_err());
    }
}
