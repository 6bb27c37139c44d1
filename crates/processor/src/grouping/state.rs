//! Per-key window state

use crate::window::WindowBounds;
use iomt_types::{GroupKey, Measurement, PartitionId};
use std::collections::{BTreeMap, BTreeSet};

/// A window still accumulating measurements
#[derive(Debug, Clone)]
pub(crate) struct OpenWindow {
    pub bounds: WindowBounds,
    /// Arrival order
    pub measurements: Vec<Measurement>,
    /// Latest occurrence time seen in this window (ms)
    pub last_seen_event_time: i64,
    /// 0 for the first emission, incremented on every reopen
    pub revision: u32,
}

impl OpenWindow {
    pub fn new(bounds: WindowBounds) -> Self {
        Self {
            bounds,
            measurements: Vec::new(),
            last_seen_event_time: i64::MIN,
            revision: 0,
        }
    }

    pub fn push(&mut self, measurement: Measurement) {
        self.last_seen_event_time = self
            .last_seen_event_time
            .max(measurement.occurrence_time_utc().timestamp_millis());
        self.measurements.push(measurement);
    }
}

/// Contents of an already emitted window, retained so it can be reopened
#[derive(Debug, Clone)]
pub(crate) struct SealedWindow {
    pub bounds: WindowBounds,
    pub measurements: Vec<Measurement>,
    pub revision: u32,
}

/// Everything the engine tracks for one group key
#[derive(Debug, Clone)]
pub(crate) struct KeyState {
    /// Partition whose watermark governs this key
    pub owner: PartitionId,
    /// Open windows by start (ms)
    pub open: BTreeMap<i64, OpenWindow>,
    /// Sealed windows retained for reopening, by start (ms)
    pub sealed: BTreeMap<i64, SealedWindow>,
    /// End (ms) of the latest window sealed for this key
    ///
    /// Keeps the owner and its sealing history alive after the last window
    /// closed, so a late measurement from a lagging partition is judged
    /// against the owner's watermark instead of opening a partial window.
    pub sealed_until: Option<i64>,
}

impl KeyState {
    pub fn new(owner: PartitionId) -> Self {
        Self {
            owner,
            open: BTreeMap::new(),
            sealed: BTreeMap::new(),
            sealed_until: None,
        }
    }

    /// Record that a window ending at `end` was sealed
    pub fn mark_sealed(&mut self, end: i64) {
        self.sealed_until = Some(self.sealed_until.map_or(end, |until| until.max(end)));
    }

    /// Drop sealed history the owner's watermark has left behind
    pub fn prune(&mut self, watermark: i64, retention: i64) {
        self.sealed
            .retain(|_, sealed| sealed.bounds.end_millis().saturating_add(retention) > watermark);
        if self
            .sealed_until
            .is_some_and(|end| end.saturating_add(retention) <= watermark)
        {
            self.sealed_until = None;
        }
    }

    /// Nothing open and no sealing history left to remember
    pub fn is_idle(&self) -> bool {
        self.open.is_empty() && self.sealed.is_empty() && self.sealed_until.is_none()
    }

    /// Reopen a retained window, or start a fresh one at `bounds`
    ///
    /// The flag is true when earlier contents were restored.
    pub fn reopen(&mut self, bounds: WindowBounds) -> (&mut OpenWindow, bool) {
        let start = bounds.start_millis();
        let retained = self.sealed.remove(&start);
        let restored = retained.is_some();

        let window = self.open.entry(start).or_insert_with(|| match retained {
            Some(sealed) => {
                let mut window = OpenWindow::new(sealed.bounds);
                window.revision = sealed.revision + 1;
                for measurement in sealed.measurements {
                    window.push(measurement);
                }
                window
            }
            None => OpenWindow::new(bounds),
        });

        (window, restored)
    }
}

/// Watermark deadlines at which keys of one partition need a visit
///
/// A key is scheduled at the end of each open window it holds (sealing) and
/// at the expiry of each sealed window it remembers (pruning). Stale
/// entries are harmless: a visit re-checks the key against the watermark.
#[derive(Debug, Default)]
pub(crate) struct Deadlines {
    due: BTreeMap<i64, BTreeSet<GroupKey>>,
}

impl Deadlines {
    pub fn schedule(&mut self, at: i64, key: GroupKey) {
        self.due.entry(at).or_default().insert(key);
    }

    /// Remove and return every key scheduled at or before `watermark`
    pub fn take_due(&mut self, watermark: i64) -> BTreeSet<GroupKey> {
        let later = match watermark.checked_add(1) {
            Some(after) => self.due.split_off(&after),
            None => BTreeMap::new(),
        };
        std::mem::replace(&mut self.due, later)
            .into_values()
            .flatten()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.due.values().map(BTreeSet::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(device: &str) -> GroupKey {
        GroupKey {
            measure_type: "HeartRate".to_string(),
            device_id: device.to_string(),
            patient_id: None,
            encounter_id: None,
            correlation_id: None,
        }
    }

    #[test]
    fn test_take_due_only_returns_passed_deadlines() {
        let mut deadlines = Deadlines::default();
        deadlines.schedule(60_000, key("d1"));
        deadlines.schedule(60_000, key("d2"));
        deadlines.schedule(120_000, key("d1"));

        assert!(deadlines.take_due(59_999).is_empty());

        let due = deadlines.take_due(60_000);
        assert_eq!(due.len(), 2);
        assert_eq!(deadlines.len(), 1);

        let due = deadlines.take_due(i64::MAX);
        assert_eq!(due.into_iter().collect::<Vec<_>>(), vec![key("d1")]);
        assert_eq!(deadlines.len(), 0);
    }

    #[test]
    fn test_sealing_history_expires_with_retention() {
        let mut state = KeyState::new(0);
        state.mark_sealed(60_000);
        state.mark_sealed(30_000);
        assert_eq!(state.sealed_until, Some(60_000));

        state.prune(100_000, 60_000);
        assert!(!state.is_idle());

        state.prune(120_000, 60_000);
        assert!(state.is_idle());
    }
}
