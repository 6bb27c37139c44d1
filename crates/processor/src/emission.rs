//! Emission stage: sealed groups to the sink
//!
//! Sealed groups are handed to a single emitter task over a bounded channel.
//! Producers await free capacity, so a slow or unavailable sink pauses intake
//! of the partitions feeding it instead of buffering without bound.
//!
//! For every group the emitter converts, then upserts each resource with
//! exponential backoff. Conversion failures and exhausted retries go to the
//! dead-letter queue; a sealed group is never dropped silently.

use crate::collaborators::ResourceSink;
use crate::config::EmissionConfig;
use crate::conversion::Converter;
use crate::dead_letter::{DeadLetterEntry, DeadLetterQueue, FailureKind};
use crate::error::{EmissionError, EmissionResult};
use crate::telemetry::EmissionCounters;
use dashmap::DashMap;
use iomt_types::{ClinicalResource, MeasurementGroup, PartitionId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// A sealed group and the partition that sealed it
#[derive(Debug, Clone)]
pub struct SealedGroup {
    pub partition: PartitionId,
    pub group: MeasurementGroup,
}

/// Totals reported by the emitter task once its queue is drained
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmitterSummary {
    pub groups: u64,
    pub counters: EmissionCounters,
}

/// Converts sealed groups and delivers the resulting resources
pub struct Emitter {
    converter: Converter,
    sink: Arc<dyn ResourceSink>,
    dead_letter: Arc<dyn DeadLetterQueue>,
    config: EmissionConfig,
    counters: Arc<DashMap<PartitionId, EmissionCounters>>,
}

impl Emitter {
    pub fn new(
        converter: Converter,
        sink: Arc<dyn ResourceSink>,
        dead_letter: Arc<dyn DeadLetterQueue>,
        config: EmissionConfig,
    ) -> Self {
        Self {
            converter,
            sink,
            dead_letter,
            config,
            counters: Arc::new(DashMap::new()),
        }
    }

    /// Start the emitter task
    ///
    /// The task runs until every [`EmissionQueue`] clone is dropped and the
    /// channel is empty.
    pub fn spawn(self) -> (EmissionQueue, JoinHandle<EmitterSummary>) {
        let (tx, mut rx) = mpsc::channel::<SealedGroup>(self.config.queue_capacity);
        let queue = EmissionQueue {
            tx,
            counters: PendingCounters {
                counters: Arc::clone(&self.counters),
            },
        };

        let handle = tokio::spawn(async move {
            let mut summary = EmitterSummary::default();
            while let Some(SealedGroup { partition, group }) = rx.recv().await {
                let counters = self.emit(partition, &group).await;
                summary.groups += 1;
                summary.counters.merge(&counters);
            }
            info!(
                groups = summary.groups,
                upserted = summary.counters.upserted_resources,
                dead_lettered = summary.counters.dead_lettered_groups,
                "Emission queue drained"
            );
            summary
        });

        (queue, handle)
    }

    /// Convert one group and upsert its resources
    ///
    /// Returns the counters of this group, which are also added to the
    /// partition's pending counters.
    pub async fn emit(&self, partition: PartitionId, group: &MeasurementGroup) -> EmissionCounters {
        let mut counters = EmissionCounters::default();

        match self.converter.convert(group) {
            Ok(resources) => {
                counters.converted_resources += resources.len() as u64;
                self.deliver(partition, group, &resources, &mut counters).await;
            }
            Err(err) => {
                warn!(
                    partition,
                    key = %group.key(),
                    window_start = %group.window_start(),
                    template = err.template().unwrap_or("-"),
                    error = %err,
                    "Conversion failed, dead-lettering group"
                );
                counters.failed_conversions += 1;
                let entry = DeadLetterEntry::group(group.clone(), FailureKind::Conversion, err.to_string())
                    .with_template(err.template().map(str::to_string));
                self.dead_letter(entry, &mut counters).await;
            }
        }

        self.counters.entry(partition).or_default().merge(&counters);
        counters
    }

    async fn deliver(
        &self,
        partition: PartitionId,
        group: &MeasurementGroup,
        resources: &[ClinicalResource],
        counters: &mut EmissionCounters,
    ) {
        for resource in resources {
            let (result, retries) = self.upsert_with_retry(resource).await;
            counters.emission_retries += u64::from(retries);

            if let Err(err) = result {
                let attempts = retries + 1;
                let err = if err.is_retryable() {
                    EmissionError::RetriesExhausted {
                        key: group.key().to_string(),
                        attempts,
                        last_error: err.to_string(),
                    }
                } else {
                    err
                };
                error!(
                    partition,
                    key = %group.key(),
                    id = %resource.id,
                    template = %resource.template,
                    attempt = attempts,
                    error = %err,
                    "Emission failed, dead-lettering group"
                );
                counters.failed_emissions += 1;
                let entry = DeadLetterEntry::group(group.clone(), FailureKind::Emission, err.to_string())
                    .with_template(Some(resource.template.clone()))
                    .with_retry_count(attempts);
                self.dead_letter(entry, counters).await;
                return;
            }

            counters.upserted_resources += 1;
        }

        debug!(
            partition,
            key = %group.key(),
            window_start = %group.window_start(),
            revision = group.revision(),
            resources = resources.len(),
            "Group emitted"
        );
    }

    /// Upsert with backoff while the error is retryable
    ///
    /// Returns the final result with the number of retries made.
    async fn upsert_with_retry(&self, resource: &ClinicalResource) -> (EmissionResult<()>, u32) {
        let mut retries = 0;

        loop {
            match self.sink.upsert(resource).await {
                Ok(()) => {
                    if retries > 0 {
                        debug!(id = %resource.id, retries, "Upsert succeeded after retries");
                    }
                    return (Ok(()), retries);
                }
                Err(err) if err.is_retryable() && retries < self.config.max_retries => {
                    let backoff = self.config.backoff(retries);
                    retries += 1;
                    warn!(
                        id = %resource.id,
                        attempt = retries,
                        max_retries = self.config.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Upsert failed, retrying"
                    );
                    sleep(backoff).await;
                }
                Err(err) => return (Err(err), retries),
            }
        }
    }

    /// Write a dead-letter entry, retrying with the upsert backoff
    ///
    /// A group the queue still refuses is counted in `lost_groups` so the
    /// batch telemetry reports it.
    async fn dead_letter(&self, entry: DeadLetterEntry, counters: &mut EmissionCounters) {
        let origin = entry.origin();
        let mut retries = 0;

        loop {
            match self.dead_letter.add(entry.clone()).await {
                Ok(()) => {
                    counters.dead_lettered_groups += 1;
                    return;
                }
                Err(err) if retries < self.config.max_retries => {
                    let backoff = self.config.backoff(retries);
                    retries += 1;
                    warn!(
                        origin = %origin,
                        attempt = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Dead-letter write failed, retrying"
                    );
                    sleep(backoff).await;
                }
                Err(err) => {
                    error!(
                        origin = %origin,
                        dlq_id = %entry.dlq_id,
                        kind = %entry.failure_kind,
                        reason = %entry.failure_reason,
                        attempts = retries + 1,
                        error = %err,
                        "Group lost: dead-letter queue unavailable"
                    );
                    counters.lost_groups += 1;
                    return;
                }
            }
        }
    }
}

/// Emission counters per partition, waiting to be reported
#[derive(Debug, Clone, Default)]
pub struct PendingCounters {
    counters: Arc<DashMap<PartitionId, EmissionCounters>>,
}

impl PendingCounters {
    /// Drain the counters recorded for a partition since the last call
    pub fn take(&self, partition: PartitionId) -> EmissionCounters {
        self.counters
            .remove(&partition)
            .map(|(_, counters)| counters)
            .unwrap_or_default()
    }
}

/// Producer side of the emitter's bounded queue
#[derive(Clone)]
pub struct EmissionQueue {
    tx: mpsc::Sender<SealedGroup>,
    counters: PendingCounters,
}

impl EmissionQueue {
    /// Enqueue a sealed group, waiting while the queue is full
    pub async fn send(&self, partition: PartitionId, group: MeasurementGroup) -> EmissionResult<()> {
        self.tx
            .send(SealedGroup { partition, group })
            .await
            .map_err(|_| EmissionError::QueueClosed)
    }

    /// Drain the emission counters recorded for a partition since the last call
    pub fn take_counters(&self, partition: PartitionId) -> EmissionCounters {
        self.counters.take(partition)
    }

    /// Counter handle that does not keep the queue open
    pub fn pending(&self) -> PendingCounters {
        self.counters.clone()
    }
}
