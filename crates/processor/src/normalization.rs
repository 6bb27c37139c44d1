//! Normalization stage: raw events to measurements
//!
//! Every event of a batch is evaluated on its own. A failing event is
//! recorded and skipped while the rest of the batch carries on, and an event
//! no template matches is counted as unmapped rather than treated as an
//! error.

use crate::config::{NormalizationConfig, UnmappedPolicy};
use crate::dead_letter::{DeadLetterEntry, FailureKind};
use crate::error::TemplateExtractionError;
use crate::telemetry::EventTypeCounters;
use crate::template::{EventContext, TemplateCollection};
use iomt_types::{Measurement, RawEvent};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// An event that failed extraction
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionFailure {
    pub event: RawEvent,
    pub error: TemplateExtractionError,
}

/// Output of normalizing one batch
#[derive(Debug, Clone, Default)]
pub struct NormalizationOutcome {
    /// Measurements of all successfully normalized events
    pub measurements: Vec<Measurement>,
    /// Events skipped because extraction failed
    pub failures: Vec<ExtractionFailure>,
    /// Unmapped events kept for the dead-letter path (empty unless configured)
    pub unmapped: Vec<RawEvent>,
    /// Per event type counters
    pub counters: BTreeMap<String, EventTypeCounters>,
}

impl NormalizationOutcome {
    pub fn unmapped_count(&self) -> u64 {
        self.counters.values().map(|c| c.unmapped).sum()
    }

    pub fn error_count(&self) -> u64 {
        self.counters.values().map(|c| c.errors).sum()
    }

    pub fn matched_count(&self) -> u64 {
        self.counters.values().map(|c| c.matched).sum()
    }

    /// Dead-letter entries for failed and retained unmapped events
    pub fn dead_letter_entries(&self) -> Vec<DeadLetterEntry> {
        let failures = self.failures.iter().map(|failure| {
            DeadLetterEntry::event(failure.event.clone(), FailureKind::Extraction, failure.error.to_string())
                .with_template(failure.error.template().map(str::to_string))
        });
        let unmapped = self
            .unmapped
            .iter()
            .map(|event| DeadLetterEntry::event(event.clone(), FailureKind::Unmapped, "unmapped"));
        failures.chain(unmapped).collect()
    }
}

/// Applies a template collection to event batches
#[derive(Debug, Clone)]
pub struct Normalizer {
    templates: Arc<TemplateCollection>,
    config: NormalizationConfig,
}

impl Normalizer {
    pub fn new(templates: Arc<TemplateCollection>, config: NormalizationConfig) -> Self {
        Self { templates, config }
    }

    pub fn templates(&self) -> &TemplateCollection {
        &self.templates
    }

    /// Normalize a batch
    pub fn normalize(&self, batch: &[RawEvent]) -> NormalizationOutcome {
        let mut outcome = NormalizationOutcome::default();

        for event in batch {
            let counters = outcome.counters.entry(event.event_type().to_string()).or_default();
            counters.events += 1;
            counters.bytes += event.size_bytes();

            let evaluated = EventContext::new(event).and_then(|ctx| self.templates.evaluate(&ctx));

            match evaluated {
                Ok(matched) if matched.is_unmapped() => {
                    counters.unmapped += 1;
                    trace!(
                        partition = event.partition(),
                        offset = event.offset(),
                        event_type = event.event_type(),
                        "Unmapped event"
                    );
                    if self.config.unmapped_policy == UnmappedPolicy::DeadLetter {
                        outcome.unmapped.push(event.clone());
                    }
                }
                Ok(matched) => {
                    counters.matched += 1;
                    outcome.measurements.extend(matched.measurements);
                }
                Err(error) => {
                    counters.errors += 1;
                    warn!(
                        partition = event.partition(),
                        offset = event.offset(),
                        template = error.template().unwrap_or("-"),
                        error = %error,
                        "Skipping event that failed extraction"
                    );
                    outcome.failures.push(ExtractionFailure {
                        event: event.clone(),
                        error,
                    });
                }
            }
        }

        debug!(
            events = batch.len(),
            measurements = outcome.measurements.len(),
            failures = outcome.failures.len(),
            "Normalized batch"
        );

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{TemplateRegistry, TemplateSource};
    use chrono::{TimeZone, Utc};
    use iomt_types::SystemProperties;
    use serde_json::json;

    fn templates() -> Arc<TemplateCollection> {
        let text = json!({
            "templateType": "JsonPathContent",
            "template": {
                "typeName": "HeartRate",
                "typeMatchExpression": "$..[?(@heartRate)]",
                "deviceIdExpression": "$.deviceId",
                "timestampExpression": "$.endDate",
                "values": [{"valueName": "hr", "valueExpression": "$.heartRate", "required": true}]
            }
        })
        .to_string();
        Arc::new(
            TemplateRegistry::default()
                .load(TemplateSource::new("devicecontent", "1"), &text)
                .unwrap(),
        )
    }

    fn event(offset: i64, payload: &str) -> RawEvent {
        RawEvent::new(
            0,
            payload.to_string(),
            SystemProperties::new(offset, offset, Utc.timestamp_millis_opt(0).unwrap()),
        )
        .with_property("eventType", "vitals")
    }

    #[test]
    fn test_failed_event_does_not_abort_batch() {
        let normalizer = Normalizer::new(templates(), NormalizationConfig::default());
        let batch = vec![
            event(1, r#"{"heartRate": 70, "deviceId": "d1", "endDate": "2024-01-01T00:00:01Z"}"#),
            event(2, r#"{"heartRate": 71, "endDate": "2024-01-01T00:00:02Z"}"#),
            event(3, r#"{"heartRate": 72, "deviceId": "d1", "endDate": "2024-01-01T00:00:03Z"}"#),
        ];

        let outcome = normalizer.normalize(&batch);

        let rates: Vec<_> = outcome.measurements.iter().map(|m| m.property("hr").unwrap()).collect();
        assert_eq!(rates, vec!["70", "72"]);
        assert_eq!(outcome.error_count(), 1);
        assert_eq!(outcome.failures[0].event.offset(), 2);
        assert_eq!(outcome.matched_count(), 2);
    }

    #[test]
    fn test_unmapped_counted_not_errored() {
        let normalizer = Normalizer::new(templates(), NormalizationConfig::default());
        let outcome = normalizer.normalize(&[event(1, r#"{"hr":72}"#)]);

        assert!(outcome.measurements.is_empty());
        assert_eq!(outcome.unmapped_count(), 1);
        assert_eq!(outcome.error_count(), 0);
        assert!(outcome.unmapped.is_empty());
        assert!(outcome.dead_letter_entries().is_empty());
    }

    #[test]
    fn test_unmapped_dead_letter_policy() {
        let normalizer = Normalizer::new(
            templates(),
            NormalizationConfig {
                unmapped_policy: UnmappedPolicy::DeadLetter,
            },
        );
        let outcome = normalizer.normalize(&[event(9, r#"{"hr":72}"#)]);

        let entries = outcome.dead_letter_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].failure_kind, FailureKind::Unmapped);
        assert_eq!(entries[0].origin(), "partition 0 offset 9");
    }

    #[test]
    fn test_malformed_payload_is_an_extraction_error() {
        let normalizer = Normalizer::new(templates(), NormalizationConfig::default());
        let outcome = normalizer.normalize(&[event(4, "not json")]);

        assert_eq!(outcome.error_count(), 1);
        assert!(matches!(
            outcome.failures[0].error,
            TemplateExtractionError::MalformedPayload { offset: 4, .. }
        ));
        assert_eq!(outcome.dead_letter_entries()[0].failure_kind, FailureKind::Extraction);
    }

    #[test]
    fn test_bytes_counted_once_per_event_type() {
        let normalizer = Normalizer::new(templates(), NormalizationConfig::default());
        let batch = vec![event(1, r#"{"hr":1}"#), event(2, r#"{"hr":2}"#)];
        let expected: u64 = batch.iter().map(RawEvent::size_bytes).sum();

        let outcome = normalizer.normalize(&batch);
        let vitals = outcome.counters["vitals"];
        assert_eq!(vitals.events, 2);
        assert_eq!(vitals.bytes, expected);
    }
}
