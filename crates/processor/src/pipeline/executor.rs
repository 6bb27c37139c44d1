//! Pipeline executor
//!
//! Runs one worker task per partition plus the emitter task. Partitions
//! progress independently; within a partition, batches are processed in
//! arrival order so its watermark advances correctly.
//!
//! When every partition is exhausted, or shutdown is signalled, the executor
//! force-seals all open windows, drains the emission queue and returns the
//! final statistics.

use super::worker::{PartitionStats, PartitionWorker, WorkerContext};
use crate::collaborators::{EventSource, ResourceSink};
use crate::config::ProcessorConfig;
use crate::conversion::Converter;
use crate::dead_letter::DeadLetterQueue;
use crate::emission::{EmissionQueue, Emitter, EmitterSummary};
use crate::error::{ProcessorError, Result};
use crate::grouping::{EngineStats, GroupingEngine};
use crate::normalization::Normalizer;
use crate::telemetry::{GroupingCounters, TelemetryAccumulator};
use iomt_types::PartitionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Final statistics of a pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub partitions: BTreeMap<PartitionId, PartitionStats>,
    /// Groups force-sealed at shutdown
    pub flushed_groups: u64,
    pub engine: EngineStats,
    pub emission: EmitterSummary,
    pub elapsed_ms: u64,
}

impl PipelineStats {
    pub fn events(&self) -> u64 {
        self.partitions.values().map(|p| p.events).sum()
    }

    pub fn bytes(&self) -> u64 {
        self.partitions.values().map(|p| p.bytes).sum()
    }

    /// Events per second over the run
    pub fn events_per_second(&self) -> f64 {
        if self.elapsed_ms > 0 {
            self.events() as f64 * 1000.0 / self.elapsed_ms as f64
        } else {
            0.0
        }
    }
}

/// Normalization, grouping and conversion wired to their collaborators
pub struct Pipeline {
    pub(super) config: ProcessorConfig,
    pub(super) normalizer: Arc<Normalizer>,
    pub(super) engine: Arc<GroupingEngine>,
    pub(super) converter: Converter,
    pub(super) source: Arc<dyn EventSource>,
    pub(super) sink: Arc<dyn ResourceSink>,
    pub(super) dead_letter: Arc<dyn DeadLetterQueue>,
}

impl Pipeline {
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn engine(&self) -> &GroupingEngine {
        &self.engine
    }

    /// Run until every partition is exhausted or `shutdown` turns true
    ///
    /// Dropping the sender of `shutdown` also stops the run.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<PipelineStats> {
        let started = Instant::now();
        let partitions = self.source.partitions().await?;
        info!(partitions = ?partitions, "Starting pipeline");

        let emitter = Emitter::new(
            self.converter.clone(),
            Arc::clone(&self.sink),
            Arc::clone(&self.dead_letter),
            self.config.emission.clone(),
        );
        let (queue, emitter_task) = emitter.spawn();

        let ctx = WorkerContext {
            normalizer: Arc::clone(&self.normalizer),
            engine: Arc::clone(&self.engine),
            source: Arc::clone(&self.source),
            sink: Arc::clone(&self.sink),
            dead_letter: Arc::clone(&self.dead_letter),
            queue: queue.clone(),
        };

        let mut workers = JoinSet::new();
        for &partition in &partitions {
            let worker = PartitionWorker::new(partition, ctx.clone());
            workers.spawn(worker.run(shutdown.clone()));
        }
        drop(ctx);

        let mut stats = PipelineStats::default();
        let mut failure: Option<ProcessorError> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(partition_stats)) => {
                    stats.partitions.insert(partition_stats.partition, partition_stats);
                }
                Ok(Err(err)) => {
                    error!(error = %err, "Partition worker failed");
                    failure.get_or_insert(err);
                }
                Err(err) => {
                    error!(error = %err, "Partition worker panicked");
                }
            }
        }

        let flushed = self.flush(&partitions, &queue).await?;
        stats.flushed_groups = flushed.values().sum();

        let mut accumulators: Vec<TelemetryAccumulator> = partitions
            .iter()
            .map(|&partition| {
                let mut accumulator = TelemetryAccumulator::new(partition);
                accumulator.record_grouping(&GroupingCounters {
                    sealed_groups: flushed.get(&partition).copied().unwrap_or(0),
                    ..Default::default()
                });
                accumulator
            })
            .collect();
        let pending = queue.pending();
        drop(queue);
        stats.emission = emitter_task
            .await
            .map_err(|e| ProcessorError::Task(format!("emitter: {}", e)))?;

        // one closing record per partition for the flush and late emissions
        for accumulator in &mut accumulators {
            accumulator.record_emission(&pending.take(accumulator.partition()));
            if accumulator.is_empty() {
                continue;
            }
            let record = accumulator.take();
            if let Err(err) = self.sink.record_telemetry(&record).await {
                warn!(partition = record.partition, error = %err, "Failed to record final telemetry");
            }
        }

        stats.engine = self.engine.stats();
        stats.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            events = stats.events(),
            flushed_groups = stats.flushed_groups,
            upserted = stats.emission.counters.upserted_resources,
            dead_lettered = stats.emission.counters.dead_lettered_groups,
            lost = stats.emission.counters.lost_groups,
            elapsed_ms = stats.elapsed_ms,
            "Pipeline stopped"
        );

        match failure {
            Some(err) => Err(err),
            None => Ok(stats),
        }
    }

    /// Force-seal every open window and enqueue the groups
    ///
    /// Returns the number of groups flushed per partition.
    async fn flush(&self, partitions: &[PartitionId], queue: &EmissionQueue) -> Result<BTreeMap<PartitionId, u64>> {
        let mut flushed = BTreeMap::new();

        for &partition in partitions {
            let groups = self.engine.flush_partition(partition)?;
            flushed.insert(partition, groups.len() as u64);
            for group in groups {
                queue.send(partition, group).await?;
            }
        }

        Ok(flushed)
    }
}
