//! In-memory event source

use super::EventSource;
use crate::error::{CollaboratorError, CollaboratorResult};
use async_trait::async_trait;
use iomt_types::{PartitionId, RawEvent};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Default)]
struct PartitionLog {
    events: Vec<RawEvent>,
    /// Index of the next event to deliver
    cursor: usize,
    checkpoint: Option<i64>,
}

/// Finite, replayable event source backed by per-partition logs
///
/// Events are delivered in the order they were appended, `batch_size` at a
/// time. Once a partition's log is consumed, [`EventSource::next_batch`]
/// returns `None`.
#[derive(Debug)]
pub struct MemoryEventSource {
    batch_size: usize,
    logs: RwLock<BTreeMap<PartitionId, PartitionLog>>,
}

impl Default for MemoryEventSource {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

impl MemoryEventSource {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            logs: RwLock::new(BTreeMap::new()),
        }
    }

    /// Append events; each lands in the log of its own partition
    pub async fn append(&self, events: impl IntoIterator<Item = RawEvent>) {
        let mut logs = self.logs.write().await;
        for event in events {
            logs.entry(event.partition()).or_default().events.push(event);
        }
    }

    /// Last checkpointed offset of a partition
    pub async fn committed(&self, partition: PartitionId) -> Option<i64> {
        self.logs.read().await.get(&partition).and_then(|log| log.checkpoint)
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn partitions(&self) -> CollaboratorResult<Vec<PartitionId>> {
        Ok(self.logs.read().await.keys().copied().collect())
    }

    async fn next_batch(&self, partition: PartitionId) -> CollaboratorResult<Option<Vec<RawEvent>>> {
        let mut logs = self.logs.write().await;
        let log = logs.get_mut(&partition).ok_or_else(|| CollaboratorError::EventSource {
            partition,
            reason: "unknown partition".to_string(),
        })?;

        if log.cursor >= log.events.len() {
            return Ok(None);
        }

        let end = (log.cursor + self.batch_size).min(log.events.len());
        let batch = log.events[log.cursor..end].to_vec();
        log.cursor = end;

        Ok(Some(batch))
    }

    async fn checkpoint(&self, partition: PartitionId, offset: i64) -> CollaboratorResult<()> {
        let mut logs = self.logs.write().await;
        let log = logs.get_mut(&partition).ok_or_else(|| CollaboratorError::EventSource {
            partition,
            reason: "unknown partition".to_string(),
        })?;

        log.checkpoint = Some(log.checkpoint.map_or(offset, |current| current.max(offset)));
        debug!(partition, offset, "Checkpoint committed");
        Ok(())
    }

    async fn rewind(&self, partition: PartitionId) -> CollaboratorResult<()> {
        let mut logs = self.logs.write().await;
        let log = logs.get_mut(&partition).ok_or_else(|| CollaboratorError::EventSource {
            partition,
            reason: "unknown partition".to_string(),
        })?;

        log.cursor = match log.checkpoint {
            Some(committed) => log
                .events
                .iter()
                .position(|event| event.offset() > committed)
                .unwrap_or(log.events.len()),
            None => 0,
        };
        debug!(partition, cursor = log.cursor, "Rewound to checkpoint");
        Ok(())
    }
}
