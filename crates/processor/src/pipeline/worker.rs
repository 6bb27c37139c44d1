//! Per-partition batch loop

use crate::collaborators::{EventSource, ResourceSink};
use crate::dead_letter::DeadLetterQueue;
use crate::emission::EmissionQueue;
use crate::error::{ProcessorError, Result};
use crate::grouping::GroupingEngine;
use crate::normalization::Normalizer;
use crate::telemetry::TelemetryAccumulator;
use iomt_types::{PartitionId, RawEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info, warn};

/// Pause before polling a partition that had nothing to deliver
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Statistics of one partition worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStats {
    pub partition: PartitionId,
    pub batches: u64,
    pub events: u64,
    pub bytes: u64,
    pub measurements: u64,
    pub unmapped_events: u64,
    pub errored_events: u64,
    pub sealed_groups: u64,
    pub late_dropped: u64,
    /// Times the partition was reset and replayed from its checkpoint
    pub restarts: u64,
    pub last_checkpoint: Option<i64>,
}

/// Everything a partition worker shares with the rest of the pipeline
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub normalizer: Arc<Normalizer>,
    pub engine: Arc<GroupingEngine>,
    pub source: Arc<dyn EventSource>,
    pub sink: Arc<dyn ResourceSink>,
    pub dead_letter: Arc<dyn DeadLetterQueue>,
    pub queue: EmissionQueue,
}

/// Drives one partition from its event source into the grouping engine
pub(crate) struct PartitionWorker {
    partition: PartitionId,
    ctx: WorkerContext,
    telemetry: TelemetryAccumulator,
    stats: PartitionStats,
}

impl PartitionWorker {
    pub fn new(partition: PartitionId, ctx: WorkerContext) -> Self {
        Self {
            partition,
            ctx,
            telemetry: TelemetryAccumulator::new(partition),
            stats: PartitionStats {
                partition,
                ..Default::default()
            },
        }
    }

    /// Process batches until the partition is exhausted or shutdown is signalled
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<PartitionStats> {
        info!(partition = self.partition, "Starting partition worker");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = self.ctx.source.next_batch(self.partition) => next?,
            };

            match next {
                None => {
                    debug!(partition = self.partition, "Partition exhausted");
                    break;
                }
                Some(events) if events.is_empty() => time::sleep(IDLE_POLL_INTERVAL).await,
                Some(events) => self.process_batch(events).await?,
            }
        }

        info!(
            partition = self.partition,
            batches = self.stats.batches,
            events = self.stats.events,
            "Partition worker stopped"
        );
        Ok(self.stats)
    }

    async fn process_batch(&mut self, events: Vec<RawEvent>) -> Result<()> {
        let partition = self.partition;
        let last_offset = events.iter().map(RawEvent::offset).max();

        let outcome = self.ctx.normalizer.normalize(&events);
        self.telemetry.record_events(&outcome.counters);
        self.telemetry.record_measurements(outcome.measurements.len());

        for entry in outcome.dead_letter_entries() {
            let origin = entry.origin();
            if let Err(err) = self.ctx.dead_letter.add(entry).await {
                error!(partition, origin = %origin, error = %err, "Failed to dead-letter event");
            }
        }

        let measurements = outcome.measurements.len() as u64;
        let unmapped = outcome.unmapped_count();
        let errored = outcome.error_count();

        let ingested = match self.ctx.engine.ingest(partition, outcome.measurements) {
            Ok(ingested) => ingested,
            Err(err) => {
                error!(partition, error = %err, "Grouping state corrupted, replaying from checkpoint");
                self.ctx.engine.reset_partition(partition);
                self.ctx.source.rewind(partition).await?;
                // the replay counts these events again
                self.telemetry.take();
                self.stats.restarts += 1;
                return Ok(());
            }
        };

        self.telemetry.record_grouping(&ingested.counters);
        let sealed = ingested.sealed.len() as u64;
        for group in ingested.sealed {
            self.ctx
                .queue
                .send(partition, group)
                .await
                .map_err(ProcessorError::from)?;
        }

        if let Some(offset) = last_offset {
            self.ctx.source.checkpoint(partition, offset).await?;
            self.stats.last_checkpoint = Some(offset);
        }

        self.telemetry.record_emission(&self.ctx.queue.take_counters(partition));
        let record = self.telemetry.take();
        if let Err(err) = self.ctx.sink.record_telemetry(&record).await {
            warn!(partition, batch = record.batch, error = %err, "Failed to record batch telemetry");
        }

        self.stats.batches += 1;
        self.stats.events += events.len() as u64;
        self.stats.bytes += record.bytes;
        self.stats.measurements += measurements;
        self.stats.unmapped_events += unmapped;
        self.stats.errored_events += errored;
        self.stats.sealed_groups += sealed;
        self.stats.late_dropped += ingested.counters.late_dropped;

        debug!(
            partition,
            batch = record.batch,
            events = events.len(),
            measurements,
            sealed,
            watermark = %self.ctx.engine.watermark(partition),
            "Batch processed"
        );

        Ok(())
    }
}
