//! Window bounds
//!
//! Windows are half-open intervals: the start is inclusive and the end is
//! exclusive, so a timestamp equal to `end` belongs to the next window.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{WindowError, WindowResult};

/// Represents the time bounds of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowBounds {
    /// Start time of the window (inclusive)
    pub start: DateTime<Utc>,
    /// End time of the window (exclusive)
    pub end: DateTime<Utc>,
}

impl WindowBounds {
    /// Create new window bounds; the start must be before the end
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> WindowResult<Self> {
        if start >= end {
            return Err(WindowError::InvalidTimestamp {
                timestamp: start.timestamp_millis(),
                reason: format!("window start must be before end {}", end.timestamp_millis()),
            });
        }
        Ok(Self { start, end })
    }

    /// Get the duration of the window
    pub fn duration(&self) -> Duration {
        self.end.signed_duration_since(self.start)
    }

    /// Check if a timestamp falls within this window
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Window end in milliseconds since the epoch
    pub fn end_millis(&self) -> i64 {
        self.end.timestamp_millis()
    }

    /// Window start in milliseconds since the epoch
    pub fn start_millis(&self) -> i64 {
        self.start.timestamp_millis()
    }
}

impl fmt::Display for WindowBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} - {})",
            self.start.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.end.format("%Y-%m-%d %H:%M:%S%.3f")
        )
    }
}

impl PartialOrd for WindowBounds {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WindowBounds {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.start.cmp(&other.start)
            .then_with(|| self.end.cmp(&other.end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn create_timestamp(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    #[test]
    fn test_window_bounds_creation() {
        let bounds = WindowBounds::new(create_timestamp(1000), create_timestamp(2000)).unwrap();

        assert_eq!(bounds.start_millis(), 1000);
        assert_eq!(bounds.end_millis(), 2000);
        assert_eq!(bounds.duration(), Duration::milliseconds(1000));
    }

    #[test]
    fn test_window_bounds_invalid() {
        assert!(WindowBounds::new(create_timestamp(2000), create_timestamp(1000)).is_err());
        assert!(WindowBounds::new(create_timestamp(1000), create_timestamp(1000)).is_err());
    }

    #[test]
    fn test_window_bounds_contains() {
        let bounds = WindowBounds::new(create_timestamp(1000), create_timestamp(2000)).unwrap();

        assert!(!bounds.contains(create_timestamp(999)));
        assert!(bounds.contains(create_timestamp(1000)));
        assert!(bounds.contains(create_timestamp(1500)));
        assert!(!bounds.contains(create_timestamp(2000)));
    }

    #[test]
    fn test_window_bounds_ordering() {
        let a = WindowBounds::new(create_timestamp(0), create_timestamp(1000)).unwrap();
        let b = WindowBounds::new(create_timestamp(1000), create_timestamp(2000)).unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_window_bounds_display() {
        let bounds = WindowBounds::new(create_timestamp(0), create_timestamp(60_000)).unwrap();
        assert_eq!(bounds.to_string(), "[1970-01-01 00:00:00.000 - 1970-01-01 00:01:00.000)");
    }
}
