//! Per-partition watermark tracking
//!
//! A partition's watermark is the maximum event time observed on it minus
//! the allowed lateness. It never moves backwards, and watermarks of
//! different partitions are never merged: each partition's late and sealing
//! decisions only depend on its own data.
//!
//! # Example
//!
//! ```rust
//! use iomt_processor::watermark::WatermarkTracker;
//! use std::time::Duration;
//!
//! let tracker = WatermarkTracker::new(Duration::from_secs(5));
//! tracker.observe(0, 10_000);
//! assert_eq!(tracker.current(0).timestamp, 5_000);
//! ```

use chrono::DateTime;
use dashmap::DashMap;
use iomt_types::PartitionId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

/// Represents a watermark timestamp
///
/// No event with a timestamp before the watermark is expected anymore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark {
    /// The watermark timestamp in milliseconds since epoch
    pub timestamp: i64,
}

impl Watermark {
    /// Creates a new watermark with the given timestamp
    pub fn new(timestamp: i64) -> Self {
        Self { timestamp }
    }

    /// Returns the minimum possible watermark (beginning of time)
    pub fn min() -> Self {
        Self { timestamp: i64::MIN }
    }

    /// Checks if this watermark is past (or at) the given timestamp
    pub fn has_passed(&self, timestamp: i64) -> bool {
        self.timestamp >= timestamp
    }

    /// Returns true if this is the minimum watermark
    pub fn is_min(&self) -> bool {
        self.timestamp == i64::MIN
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::min()
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match DateTime::from_timestamp_millis(self.timestamp) {
            Some(dt) if !self.is_min() => write!(f, "Watermark({})", dt),
            _ => write!(f, "Watermark({})", self.timestamp),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PartitionClock {
    max_event_time: i64,
    watermark: Watermark,
}

/// Tracks one bounded-out-of-orderness watermark per partition
#[derive(Debug)]
pub struct WatermarkTracker {
    allowed_lateness_ms: i64,
    partitions: DashMap<PartitionId, PartitionClock>,
}

impl WatermarkTracker {
    /// Create a tracker with the given allowed lateness
    pub fn new(allowed_lateness: Duration) -> Self {
        Self {
            allowed_lateness_ms: i64::try_from(allowed_lateness.as_millis()).unwrap_or(i64::MAX),
            partitions: DashMap::new(),
        }
    }

    /// Record an event time on a partition
    ///
    /// Returns the new watermark if it advanced.
    pub fn observe(&self, partition: PartitionId, timestamp: i64) -> Option<Watermark> {
        let candidate = Watermark::new(timestamp.saturating_sub(self.allowed_lateness_ms));

        let mut clock = self.partitions.entry(partition).or_insert(PartitionClock {
            max_event_time: i64::MIN,
            watermark: Watermark::min(),
        });

        clock.max_event_time = clock.max_event_time.max(timestamp);

        if candidate > clock.watermark {
            clock.watermark = candidate;
            trace!(partition, watermark = %candidate, "Advanced watermark");
            Some(candidate)
        } else {
            None
        }
    }

    /// Current watermark of a partition (minimum if nothing was observed)
    pub fn current(&self, partition: PartitionId) -> Watermark {
        self.partitions
            .get(&partition)
            .map(|clock| clock.watermark)
            .unwrap_or_default()
    }

    /// Maximum event time observed on a partition
    pub fn max_event_time(&self, partition: PartitionId) -> Option<i64> {
        self.partitions.get(&partition).map(|clock| clock.max_event_time)
    }

    /// Whether a timestamp is behind the partition's watermark
    pub fn is_late(&self, partition: PartitionId, timestamp: i64) -> bool {
        timestamp < self.current(partition).timestamp
    }

    /// Forget a partition's clock, e.g. before replaying it from a checkpoint
    pub fn reset(&self, partition: PartitionId) {
        self.partitions.remove(&partition);
        debug!(partition, "Watermark reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_ordering() {
        assert!(Watermark::new(100) < Watermark::new(200));
        assert!(Watermark::min() < Watermark::new(i64::MIN + 1));
    }

    #[test]
    fn test_watermark_trails_max_event_time() {
        let tracker = WatermarkTracker::new(Duration::from_millis(5_000));

        assert_eq!(tracker.observe(0, 10_000), Some(Watermark::new(5_000)));
        assert_eq!(tracker.current(0), Watermark::new(5_000));
        assert_eq!(tracker.max_event_time(0), Some(10_000));
    }

    #[test]
    fn test_watermark_never_regresses() {
        let tracker = WatermarkTracker::new(Duration::from_millis(1_000));

        tracker.observe(0, 10_000);
        assert_eq!(tracker.observe(0, 2_000), None);
        assert_eq!(tracker.current(0), Watermark::new(9_000));
        assert_eq!(tracker.max_event_time(0), Some(10_000));
    }

    #[test]
    fn test_partitions_are_independent() {
        let tracker = WatermarkTracker::new(Duration::ZERO);

        tracker.observe(0, 50_000);
        tracker.observe(1, 1_000);

        assert_eq!(tracker.current(0), Watermark::new(50_000));
        assert_eq!(tracker.current(1), Watermark::new(1_000));
        assert!(tracker.is_late(0, 10_000));
        assert!(!tracker.is_late(1, 10_000));
        assert!(tracker.current(7).is_min());
    }

    #[test]
    fn test_reset_partition() {
        let tracker = WatermarkTracker::new(Duration::ZERO);
        tracker.observe(3, 5_000);
        tracker.reset(3);
        assert!(tracker.current(3).is_min());
        assert_eq!(tracker.max_event_time(3), None);
    }
}
