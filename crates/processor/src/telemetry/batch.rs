//! Per-batch pipeline counters
//!
//! Each partition task owns a [`TelemetryAccumulator`]; nothing in it is
//! shared, so increments are plain field updates. At the end of a batch the
//! accumulator absorbs the emitter's counters for that partition and is
//! drained into one [`BatchTelemetry`] record for the sink.

use chrono::{DateTime, Utc};
use iomt_types::PartitionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Counters of one event type within a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTypeCounters {
    pub events: u64,
    /// Payload plus property bytes
    pub bytes: u64,
    pub matched: u64,
    pub unmapped: u64,
    pub errors: u64,
}

impl EventTypeCounters {
    pub fn merge(&mut self, other: &EventTypeCounters) {
        self.events += other.events;
        self.bytes += other.bytes;
        self.matched += other.matched;
        self.unmapped += other.unmapped;
        self.errors += other.errors;
    }
}

/// Counters produced by the grouping stage for one ingest call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupingCounters {
    pub sealed_groups: u64,
    pub late_accepted: u64,
    pub late_dropped: u64,
    pub reopened_groups: u64,
}

impl GroupingCounters {
    pub fn merge(&mut self, other: &GroupingCounters) {
        self.sealed_groups += other.sealed_groups;
        self.late_accepted += other.late_accepted;
        self.late_dropped += other.late_dropped;
        self.reopened_groups += other.reopened_groups;
    }
}

/// Counters produced by the emitter for groups of one partition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmissionCounters {
    pub converted_resources: u64,
    pub failed_conversions: u64,
    pub upserted_resources: u64,
    pub emission_retries: u64,
    pub failed_emissions: u64,
    pub dead_lettered_groups: u64,
    /// Groups the dead-letter queue refused after every retry
    pub lost_groups: u64,
}

impl EmissionCounters {
    pub fn merge(&mut self, other: &EmissionCounters) {
        self.converted_resources += other.converted_resources;
        self.failed_conversions += other.failed_conversions;
        self.upserted_resources += other.upserted_resources;
        self.emission_retries += other.emission_retries;
        self.failed_emissions += other.failed_emissions;
        self.dead_lettered_groups += other.dead_lettered_groups;
        self.lost_groups += other.lost_groups;
    }
}

/// Flat telemetry record of one processed batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTelemetry {
    pub partition: PartitionId,
    /// Sequence number of the batch within its partition
    pub batch: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,

    pub events: u64,
    pub bytes: u64,
    pub matched_events: u64,
    pub unmapped_events: u64,
    pub errored_events: u64,
    pub measurements: u64,

    pub sealed_groups: u64,
    pub late_accepted: u64,
    pub late_dropped: u64,
    pub reopened_groups: u64,

    pub converted_resources: u64,
    pub failed_conversions: u64,
    pub upserted_resources: u64,
    pub emission_retries: u64,
    pub failed_emissions: u64,
    pub dead_lettered_groups: u64,
    pub lost_groups: u64,

    /// Event counters keyed by the `eventType` application property
    pub by_event_type: BTreeMap<String, EventTypeCounters>,
}

/// Accumulates counters of the current batch of one partition
#[derive(Debug, Clone)]
pub struct TelemetryAccumulator {
    partition: PartitionId,
    batch: u64,
    started_at: DateTime<Utc>,
    measurements: u64,
    by_event_type: BTreeMap<String, EventTypeCounters>,
    grouping: GroupingCounters,
    emission: EmissionCounters,
}

impl TelemetryAccumulator {
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            batch: 0,
            started_at: Utc::now(),
            measurements: 0,
            by_event_type: BTreeMap::new(),
            grouping: GroupingCounters::default(),
            emission: EmissionCounters::default(),
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Add event counters produced by the normalizer
    pub fn record_events(&mut self, counters: &BTreeMap<String, EventTypeCounters>) {
        for (event_type, counter) in counters {
            self.by_event_type
                .entry(event_type.clone())
                .or_default()
                .merge(counter);
        }
    }

    pub fn record_measurements(&mut self, count: usize) {
        self.measurements += count as u64;
    }

    pub fn record_grouping(&mut self, counters: &GroupingCounters) {
        self.grouping.merge(counters);
    }

    pub fn record_emission(&mut self, counters: &EmissionCounters) {
        self.emission.merge(counters);
    }

    /// Whether anything was recorded since the last drain
    pub fn is_empty(&self) -> bool {
        self.by_event_type.is_empty()
            && self.measurements == 0
            && self.grouping == GroupingCounters::default()
            && self.emission == EmissionCounters::default()
    }

    /// Drain the current batch into a record and start the next one
    pub fn take(&mut self) -> BatchTelemetry {
        let totals = self
            .by_event_type
            .values()
            .fold(EventTypeCounters::default(), |mut acc, c| {
                acc.merge(c);
                acc
            });

        let record = BatchTelemetry {
            partition: self.partition,
            batch: self.batch,
            started_at: self.started_at,
            completed_at: Utc::now(),
            events: totals.events,
            bytes: totals.bytes,
            matched_events: totals.matched,
            unmapped_events: totals.unmapped,
            errored_events: totals.errors,
            measurements: self.measurements,
            sealed_groups: self.grouping.sealed_groups,
            late_accepted: self.grouping.late_accepted,
            late_dropped: self.grouping.late_dropped,
            reopened_groups: self.grouping.reopened_groups,
            converted_resources: self.emission.converted_resources,
            failed_conversions: self.emission.failed_conversions,
            upserted_resources: self.emission.upserted_resources,
            emission_retries: self.emission.emission_retries,
            failed_emissions: self.emission.failed_emissions,
            dead_lettered_groups: self.emission.dead_lettered_groups,
            lost_groups: self.emission.lost_groups,
            by_event_type: std::mem::take(&mut self.by_event_type),
        };

        self.batch += 1;
        self.started_at = Utc::now();
        self.measurements = 0;
        self.grouping = GroupingCounters::default();
        self.emission = EmissionCounters::default();

        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(events: u64, bytes: u64, matched: u64, unmapped: u64, errors: u64) -> EventTypeCounters {
        EventTypeCounters {
            events,
            bytes,
            matched,
            unmapped,
            errors,
        }
    }

    #[test]
    fn test_take_sums_event_types() {
        let mut acc = TelemetryAccumulator::new(3);

        let mut batch = BTreeMap::new();
        batch.insert("hr".to_string(), counters(2, 100, 2, 0, 0));
        batch.insert("unknown".to_string(), counters(1, 10, 0, 1, 0));
        acc.record_events(&batch);
        acc.record_measurements(2);
        acc.record_grouping(&GroupingCounters {
            sealed_groups: 1,
            late_dropped: 1,
            ..Default::default()
        });
        acc.record_emission(&EmissionCounters {
            converted_resources: 1,
            upserted_resources: 1,
            ..Default::default()
        });

        let record = acc.take();
        assert_eq!(record.partition, 3);
        assert_eq!(record.batch, 0);
        assert_eq!(record.events, 3);
        assert_eq!(record.bytes, 110);
        assert_eq!(record.matched_events, 2);
        assert_eq!(record.unmapped_events, 1);
        assert_eq!(record.sealed_groups, 1);
        assert_eq!(record.late_dropped, 1);
        assert_eq!(record.converted_resources, 1);
        assert_eq!(record.by_event_type.len(), 2);
    }

    #[test]
    fn test_take_resets_counters() {
        let mut acc = TelemetryAccumulator::new(0);
        let mut batch = BTreeMap::new();
        batch.insert("hr".to_string(), counters(1, 5, 1, 0, 0));
        acc.record_events(&batch);
        acc.record_events(&batch);
        assert!(!acc.is_empty());

        let first = acc.take();
        assert_eq!(first.events, 2);
        assert_eq!(first.by_event_type["hr"].bytes, 10);
        assert!(acc.is_empty());

        let second = acc.take();
        assert_eq!(second.batch, 1);
        assert_eq!(second.events, 0);
        assert!(second.by_event_type.is_empty());
    }
}
