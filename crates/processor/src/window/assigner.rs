//! Window assigners
//!
//! Maps an event timestamp to the window it belongs to.

use super::types::WindowBounds;
use crate::error::{WindowError, WindowResult};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::fmt;

/// Trait for assigning timestamps to windows
pub trait WindowAssigner: Send + Sync + fmt::Debug {
    /// Assign a timestamp to its window
    fn assign(&self, timestamp: DateTime<Utc>) -> WindowResult<WindowBounds>;
}

/// Tumbling window assigner
///
/// Creates fixed-size, non-overlapping windows aligned to the epoch. Each
/// timestamp is assigned to exactly one window.
///
/// # Example
/// ```text
/// Window size: 5 seconds
/// Event at timestamp 7 -> Window [5, 10)
/// Event at timestamp 10 -> Window [10, 15)
/// ```
#[derive(Debug, Clone)]
pub struct TumblingWindowAssigner {
    /// Size of each window
    size: Duration,
}

impl TumblingWindowAssigner {
    /// Create a new tumbling window assigner
    pub fn new(size: Duration) -> WindowResult<Self> {
        if size.num_milliseconds() <= 0 {
            return Err(WindowError::InvalidWindowSize {
                size: size.num_milliseconds(),
            });
        }
        Ok(Self { size })
    }

    /// Create an assigner from a size in milliseconds
    pub fn from_millis(size_ms: u64) -> WindowResult<Self> {
        let size_ms = i64::try_from(size_ms).map_err(|_| WindowError::InvalidWindowSize { size: i64::MAX })?;
        Self::new(Duration::milliseconds(size_ms))
    }

    /// Window size
    pub fn size(&self) -> Duration {
        self.size
    }

    /// Calculate the window start for a given timestamp
    fn window_start(&self, timestamp: DateTime<Utc>) -> WindowResult<DateTime<Utc>> {
        let ts_millis = timestamp.timestamp_millis();
        let size_millis = self.size.num_milliseconds();

        // Euclidean floor keeps pre-epoch timestamps in the right window
        let aligned = ts_millis.div_euclid(size_millis) * size_millis;

        Utc.timestamp_millis_opt(aligned)
            .single()
            .ok_or_else(|| WindowError::InvalidTimestamp {
                timestamp: ts_millis,
                reason: "aligned window start out of range".to_string(),
            })
    }
}

impl WindowAssigner for TumblingWindowAssigner {
    fn assign(&self, timestamp: DateTime<Utc>) -> WindowResult<WindowBounds> {
        let start = self.window_start(timestamp)?;
        let end = start
            .checked_add_signed(self.size)
            .ok_or_else(|| WindowError::InvalidTimestamp {
                timestamp: timestamp.timestamp_millis(),
                reason: "window end out of range".to_string(),
            })?;
        WindowBounds::new(start, end)
    }
}
