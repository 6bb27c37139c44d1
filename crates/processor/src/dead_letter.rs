//! Dead-letter path
//!
//! Everything the pipeline gives up on lands here with enough context to
//! replay it by hand:
//! - sealed groups whose conversion failed or whose emission exhausted its
//!   retries (group key, template, attempts)
//! - raw events whose extraction failed, and unmapped events when the
//!   normalizer is configured to dead-letter them (partition, offset)
//!
//! Two implementations sit behind the async [`DeadLetterQueue`] trait:
//! - [`MemoryDeadLetterQueue`]: keeps entries in memory
//! - [`FileDeadLetterQueue`]: appends JSON lines to `dlq_current.jsonl`

use crate::config::{DeadLetterConfig, DeadLetterKind};
use crate::error::{CollaboratorError, CollaboratorResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use iomt_types::{MeasurementGroup, RawEvent};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Name of the active file of a [`FileDeadLetterQueue`]
pub const CURRENT_FILE: &str = "dlq_current.jsonl";

/// Why an item was dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No template matched the event
    Unmapped,
    /// A template matched but extraction failed
    Extraction,
    /// The sealed group could not be converted
    Conversion,
    /// The sink kept failing until retries ran out
    Emission,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FailureKind::Unmapped => "unmapped",
            FailureKind::Extraction => "extraction",
            FailureKind::Conversion => "conversion",
            FailureKind::Emission => "emission",
        };
        f.write_str(text)
    }
}

/// The failed item itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "item", rename_all = "snake_case")]
pub enum DeadLetterItem {
    Group(MeasurementGroup),
    Event(RawEvent),
}

/// DLQ entry structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Unique entry id
    pub dlq_id: Uuid,
    pub item: DeadLetterItem,
    pub failure_kind: FailureKind,
    pub failure_reason: String,
    /// Template involved in the failure, if any
    pub template: Option<String>,
    /// Delivery attempts made before giving up
    pub retry_count: u32,
    pub failure_timestamp: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Entry for a sealed group
    pub fn group(group: MeasurementGroup, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self::new(DeadLetterItem::Group(group), kind, reason)
    }

    /// Entry for a raw event
    pub fn event(event: RawEvent, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self::new(DeadLetterItem::Event(event), kind, reason)
    }

    fn new(item: DeadLetterItem, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            dlq_id: Uuid::new_v4(),
            item,
            failure_kind: kind,
            failure_reason: reason.into(),
            template: None,
            retry_count: 0,
            failure_timestamp: Utc::now(),
        }
    }

    pub fn with_template(mut self, template: Option<String>) -> Self {
        self.template = template;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Where the item came from: group key and window, or partition and offset
    pub fn origin(&self) -> String {
        match &self.item {
            DeadLetterItem::Group(group) => format!(
                "group {} window [{} - {})",
                group.key(),
                group.window_start(),
                group.window_end()
            ),
            DeadLetterItem::Event(event) => {
                format!("partition {} offset {}", event.partition(), event.offset())
            }
        }
    }
}

/// DLQ statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    /// Entries added since creation
    pub total_entries: u64,
    /// Entries currently held
    pub current_depth: usize,
    pub groups: u64,
    pub events: u64,
    /// Size of the active file (file queue only)
    pub file_size_bytes: u64,
}

impl DeadLetterStats {
    fn record(&mut self, entry: &DeadLetterEntry) {
        self.total_entries += 1;
        self.current_depth += 1;
        match entry.item {
            DeadLetterItem::Group(_) => self.groups += 1,
            DeadLetterItem::Event(_) => self.events += 1,
        }
    }
}

/// Dead Letter Queue trait
#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    /// Add entry to DLQ
    async fn add(&self, entry: DeadLetterEntry) -> CollaboratorResult<()>;

    /// Page through held entries in insertion order
    async fn list(&self, offset: usize, limit: usize) -> CollaboratorResult<Vec<DeadLetterEntry>>;

    /// Get DLQ statistics
    async fn stats(&self) -> CollaboratorResult<DeadLetterStats>;
}

/// Build the configured dead-letter queue
pub async fn from_config(config: &DeadLetterConfig) -> CollaboratorResult<Arc<dyn DeadLetterQueue>> {
    match (config.kind, &config.path) {
        (DeadLetterKind::Memory, _) => Ok(Arc::new(MemoryDeadLetterQueue::new())),
        (DeadLetterKind::File, Some(path)) => Ok(Arc::new(FileDeadLetterQueue::new(path).await?)),
        (DeadLetterKind::File, None) => Err(CollaboratorError::DeadLetter(
            "file dead-letter queue requires a path".to_string(),
        )),
    }
}

/// In-memory DLQ
#[derive(Debug, Default)]
pub struct MemoryDeadLetterQueue {
    entries: RwLock<Vec<DeadLetterEntry>>,
    stats: RwLock<DeadLetterStats>,
}

impl MemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every held entry
    pub async fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl DeadLetterQueue for MemoryDeadLetterQueue {
    async fn add(&self, entry: DeadLetterEntry) -> CollaboratorResult<()> {
        warn!(
            dlq_id = %entry.dlq_id,
            kind = %entry.failure_kind,
            origin = %entry.origin(),
            reason = %entry.failure_reason,
            "Dead-lettered"
        );
        self.stats.write().await.record(&entry);
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn list(&self, offset: usize, limit: usize) -> CollaboratorResult<Vec<DeadLetterEntry>> {
        let entries = self.entries.read().await;
        Ok(entries.iter().skip(offset).take(limit).cloned().collect())
    }

    async fn stats(&self) -> CollaboratorResult<DeadLetterStats> {
        Ok(self.stats.read().await.clone())
    }
}

/// File-based DLQ writing one JSON document per line
#[derive(Debug)]
pub struct FileDeadLetterQueue {
    current_file: PathBuf,
    stats: RwLock<DeadLetterStats>,
}

impl FileDeadLetterQueue {
    /// Create the directory if needed and pick up an existing file
    pub async fn new(dir: impl AsRef<Path>) -> CollaboratorResult<Self> {
        fs::create_dir_all(dir.as_ref()).await?;
        let current_file = dir.as_ref().join(CURRENT_FILE);

        let queue = Self {
            current_file,
            stats: RwLock::new(DeadLetterStats::default()),
        };

        let existing = queue.read_entries().await?;
        {
            let mut stats = queue.stats.write().await;
            for entry in &existing {
                stats.record(entry);
            }
            stats.file_size_bytes = queue.file_size().await?;
        }
        debug!(path = %queue.current_file.display(), existing = existing.len(), "Opened file DLQ");

        Ok(queue)
    }

    pub fn path(&self) -> &Path {
        &self.current_file
    }

    async fn file_size(&self) -> CollaboratorResult<u64> {
        match fs::metadata(&self.current_file).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_entries(&self) -> CollaboratorResult<Vec<DeadLetterEntry>> {
        let content = match fs::read_to_string(&self.current_file).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<DeadLetterEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(error = %e, "Failed to deserialize DLQ entry"),
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl DeadLetterQueue for FileDeadLetterQueue {
    async fn add(&self, entry: DeadLetterEntry) -> CollaboratorResult<()> {
        let mut line =
            serde_json::to_string(&entry).map_err(|e| CollaboratorError::DeadLetter(e.to_string()))?;
        line.push('\n');

        let mut stats = self.stats.write().await;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.current_file)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        stats.record(&entry);
        stats.file_size_bytes = self.file_size().await?;

        warn!(
            dlq_id = %entry.dlq_id,
            kind = %entry.failure_kind,
            origin = %entry.origin(),
            reason = %entry.failure_reason,
            path = %self.current_file.display(),
            "Dead-lettered to file"
        );
        Ok(())
    }

    async fn list(&self, offset: usize, limit: usize) -> CollaboratorResult<Vec<DeadLetterEntry>> {
        let entries = self.read_entries().await?;
        Ok(entries.into_iter().skip(offset).take(limit).collect())
    }

    async fn stats(&self) -> CollaboratorResult<DeadLetterStats> {
        let mut stats = self.stats.read().await.clone();
        stats.file_size_bytes = self.file_size().await?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use iomt_types::{Measurement, SystemProperties};

    fn create_timestamp(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn sample_group() -> MeasurementGroup {
        let m = Measurement::new("HeartRate", "dev-1", create_timestamp(10_000)).with_property("hr", "72");
        MeasurementGroup::sealed(m.group_key(), create_timestamp(0), create_timestamp(60_000), vec![m]).unwrap()
    }

    fn sample_event() -> RawEvent {
        RawEvent::new(2, r#"{"hr":72}"#, SystemProperties::new(5, 77, create_timestamp(0)))
    }

    #[tokio::test]
    async fn test_memory_dlq_add_and_list() {
        let dlq = MemoryDeadLetterQueue::new();

        dlq.add(
            DeadLetterEntry::group(sample_group(), FailureKind::Conversion, "missing hr")
                .with_template(Some("heartrate".to_string())),
        )
        .await
        .unwrap();
        dlq.add(DeadLetterEntry::event(sample_event(), FailureKind::Unmapped, "unmapped"))
            .await
            .unwrap();

        let stats = dlq.stats().await.unwrap();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.groups, 1);
        assert_eq!(stats.events, 1);

        let page = dlq.list(1, 10).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].failure_kind, FailureKind::Unmapped);
        assert_eq!(page[0].origin(), "partition 2 offset 77");
    }

    #[tokio::test]
    async fn test_file_dlq_add_and_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let dlq = FileDeadLetterQueue::new(dir.path()).await.unwrap();
        let entry = DeadLetterEntry::group(sample_group(), FailureKind::Emission, "sink down").with_retry_count(5);
        let dlq_id = entry.dlq_id;
        dlq.add(entry).await.unwrap();

        let stats = dlq.stats().await.unwrap();
        assert_eq!(stats.total_entries, 1);
        assert!(stats.file_size_bytes > 0);

        let reopened = FileDeadLetterQueue::new(dir.path()).await.unwrap();
        let entries = reopened.list(0, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].dlq_id, dlq_id);
        assert_eq!(entries[0].retry_count, 5);
        assert_eq!(entries[0].item, DeadLetterItem::Group(sample_group()));
        assert_eq!(reopened.stats().await.unwrap().current_depth, 1);
    }

    #[tokio::test]
    async fn test_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = DeadLetterConfig {
            kind: DeadLetterKind::File,
            path: Some(dir.path().to_path_buf()),
        };
        let dlq = from_config(&config).await.unwrap();
        dlq.add(DeadLetterEntry::event(sample_event(), FailureKind::Extraction, "bad"))
            .await
            .unwrap();
        assert!(dir.path().join(CURRENT_FILE).exists());

        let missing = DeadLetterConfig {
            kind: DeadLetterKind::File,
            path: None,
        };
        assert!(from_config(&missing).await.is_err());
    }

    #[test]
    fn test_entry_serialization() {
        let entry = DeadLetterEntry::event(sample_event(), FailureKind::Extraction, "bad timestamp")
            .with_template(Some("HeartRate".to_string()));
        let json = serde_json::to_string(&entry).unwrap();
        let back: DeadLetterEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
        assert!(json.contains("\"failure_kind\":\"extraction\""));
    }
}
