//! Grouping engine: time-windowed aggregation of measurements
//!
//! Measurements are grouped by [`GroupKey`] into epoch-aligned tumbling
//! windows. A window seals once the watermark of the key's owning partition
//! reaches its end, and is then emitted exactly once as a
//! [`MeasurementGroup`] ordered by occurrence time.
//!
//! ## State
//!
//! Per-key state lives in a `DashMap`, so different keys never contend and
//! one key is only ever mutated under its shard lock. The partition whose
//! measurement first created a key's state owns it: that partition's
//! watermark decides lateness and sealing for the key. Watermarks of
//! different partitions are never merged.
//!
//! A key's state outlives its last open window by `late_retention_ms`, so
//! its owner and sealing history are still known when a lagging partition
//! delivers a measurement for a window that already sealed.
//!
//! Sealing is driven by a per-partition deadline index: an ingest call only
//! visits keys whose window end (or retention expiry) the owning watermark
//! has reached, never the whole key space.
//!
//! ## Late data
//!
//! A measurement behind the watermark whose window is still open is simply
//! added. If the window has already sealed:
//! - [`LatePolicy::Drop`]: the measurement is dropped and counted
//! - [`LatePolicy::Reopen`]: the window is reopened with its previous
//!   contents plus the late measurement and re-emitted with a higher
//!   revision, as long as the window ended less than `late_retention_ms`
//!   before the watermark; older windows are dropped and counted
//!
//! Once the sealing history has expired, a key is forgotten entirely and a
//! later measurement starts a new window under whichever partition sends it.
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use iomt_processor::config::WindowConfig;
//! use iomt_processor::grouping::GroupingEngine;
//! use iomt_types::Measurement;
//!
//! let engine = GroupingEngine::new(WindowConfig::tumbling(60_000, 5_000)).unwrap();
//! let at = |secs| Utc.timestamp_opt(secs, 0).unwrap();
//!
//! let outcome = engine
//!     .ingest(0, vec![
//!         Measurement::new("HeartRate", "dev-1", at(10)),
//!         Measurement::new("HeartRate", "dev-1", at(50)),
//!         Measurement::new("HeartRate", "dev-1", at(66)),
//!     ])
//!     .unwrap();
//!
//! assert_eq!(outcome.sealed.len(), 1);
//! assert_eq!(outcome.sealed[0].len(), 2);
//! ```

mod state;

use crate::config::{LatePolicy, WindowConfig};
use crate::error::{EngineResult, EngineStateError, WindowResult};
use crate::telemetry::GroupingCounters;
use crate::watermark::{Watermark, WatermarkTracker};
use crate::window::{TumblingWindowAssigner, WindowAssigner};
use dashmap::DashMap;
use iomt_types::{GroupKey, Measurement, MeasurementGroup, PartitionId};
use serde::{Deserialize, Serialize};
use state::{Deadlines, KeyState, OpenWindow, SealedWindow};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

/// Result of one ingest call
#[derive(Debug, Clone, Default)]
pub struct IngestOutcome {
    /// Groups sealed by this call, ordered by window end then key
    pub sealed: Vec<MeasurementGroup>,
    pub counters: GroupingCounters,
}

/// Snapshot of engine state and lifetime counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub tracked_keys: usize,
    pub open_windows: usize,
    /// Sealed windows retained for reopening
    pub retained_windows: usize,
    /// Pending sealing and pruning deadlines across partitions
    pub scheduled_deadlines: usize,
    pub sealed_groups: u64,
    pub late_accepted: u64,
    pub late_dropped: u64,
    pub reopened_groups: u64,
}

#[derive(Debug, Default)]
struct EngineCounters {
    sealed_groups: AtomicU64,
    late_accepted: AtomicU64,
    late_dropped: AtomicU64,
    reopened_groups: AtomicU64,
}

impl EngineCounters {
    fn add(&self, counters: &GroupingCounters) {
        self.sealed_groups.fetch_add(counters.sealed_groups, Ordering::Relaxed);
        self.late_accepted.fetch_add(counters.late_accepted, Ordering::Relaxed);
        self.late_dropped.fetch_add(counters.late_dropped, Ordering::Relaxed);
        self.reopened_groups.fetch_add(counters.reopened_groups, Ordering::Relaxed);
    }
}

/// Stateful windowed grouping of measurements
#[derive(Debug)]
pub struct GroupingEngine {
    config: WindowConfig,
    assigner: TumblingWindowAssigner,
    watermarks: WatermarkTracker,
    keys: DashMap<GroupKey, KeyState>,
    deadlines: DashMap<PartitionId, Deadlines>,
    counters: EngineCounters,
}

impl GroupingEngine {
    /// Create an engine for the given window configuration
    pub fn new(config: WindowConfig) -> WindowResult<Self> {
        let assigner = TumblingWindowAssigner::from_millis(config.size_ms)?;
        let watermarks = WatermarkTracker::new(config.allowed_lateness());

        info!(
            window_ms = config.size_ms,
            allowed_lateness_ms = config.allowed_lateness_ms,
            late_policy = ?config.late_policy,
            "Created grouping engine"
        );

        Ok(Self {
            config,
            assigner,
            watermarks,
            keys: DashMap::new(),
            deadlines: DashMap::new(),
            counters: EngineCounters::default(),
        })
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Current watermark of a partition
    pub fn watermark(&self, partition: PartitionId) -> Watermark {
        self.watermarks.current(partition)
    }

    fn retention_ms(&self) -> i64 {
        i64::try_from(self.config.late_retention_ms).unwrap_or(i64::MAX)
    }

    /// Ingest measurements of one partition in arrival order
    ///
    /// Returns the groups whose windows sealed as a result.
    pub fn ingest(&self, partition: PartitionId, measurements: Vec<Measurement>) -> EngineResult<IngestOutcome> {
        let mut counters = GroupingCounters::default();
        // partitions whose deadlines may have come due during this call
        let mut owners: BTreeSet<PartitionId> = BTreeSet::from([partition]);

        for measurement in measurements {
            let occurred = measurement.occurrence_time_utc();
            let ts = occurred.timestamp_millis();

            let bounds = match self.assigner.assign(occurred) {
                Ok(bounds) => bounds,
                Err(e) => {
                    warn!(partition, error = %e, "Dropping measurement without a window");
                    counters.late_dropped += 1;
                    continue;
                }
            };

            let key = measurement.group_key();
            {
                let mut entry = self
                    .keys
                    .entry(key.clone())
                    .or_insert_with(|| KeyState::new(partition));
                let state: &mut KeyState = &mut entry;
                let owner = state.owner;
                let watermark = self.watermarks.current(owner);
                let start = bounds.start_millis();
                let behind = ts < watermark.timestamp;

                if let Some(window) = state.open.get_mut(&start) {
                    window.push(measurement);
                    if behind {
                        counters.late_accepted += 1;
                    }
                } else if !watermark.has_passed(bounds.end_millis()) {
                    let mut window = OpenWindow::new(bounds);
                    window.push(measurement);
                    state.open.insert(start, window);
                    self.schedule(owner, bounds.end_millis(), &key);
                    if behind {
                        counters.late_accepted += 1;
                    }
                } else if self.config.late_policy == LatePolicy::Reopen
                    && bounds.end_millis().saturating_add(self.retention_ms()) > watermark.timestamp
                {
                    let (window, restored) = state.reopen(bounds);
                    window.push(measurement);
                    counters.late_accepted += 1;
                    if restored {
                        counters.reopened_groups += 1;
                        debug!(key = %key, window = %bounds, "Reopened sealed window");
                    }
                    // already past the owner's watermark: seals in this call
                    self.schedule(owner, bounds.end_millis(), &key);
                    owners.insert(owner);
                } else {
                    counters.late_dropped += 1;
                    debug!(
                        partition,
                        owner,
                        key = %key,
                        window = %bounds,
                        watermark = %watermark,
                        "Dropped late measurement"
                    );
                }
            }

            self.watermarks.observe(partition, ts);
        }

        let sealed = self.seal_due(&owners)?;
        counters.sealed_groups += sealed.len() as u64;
        self.counters.add(&counters);

        trace!(
            partition,
            sealed = sealed.len(),
            late_dropped = counters.late_dropped,
            "Ingested measurements"
        );

        Ok(IngestOutcome { sealed, counters })
    }

    fn schedule(&self, owner: PartitionId, at: i64, key: &GroupKey) {
        self.deadlines.entry(owner).or_default().schedule(at, key.clone());
    }

    fn take_due(&self, owner: PartitionId, watermark: Watermark) -> BTreeSet<GroupKey> {
        self.deadlines
            .get_mut(&owner)
            .map(|mut deadlines| deadlines.take_due(watermark.timestamp))
            .unwrap_or_default()
    }

    /// Visit the keys whose deadlines the owners' watermarks have reached:
    /// seal their passed windows and prune expired sealing history
    fn seal_due(&self, owners: &BTreeSet<PartitionId>) -> EngineResult<Vec<MeasurementGroup>> {
        let retain_sealed = self.config.late_policy == LatePolicy::Reopen;
        let retention = self.retention_ms();
        let mut groups = Vec::new();

        for &owner in owners {
            let watermark = self.watermarks.current(owner);

            for key in self.take_due(owner, watermark) {
                let idle = {
                    let Some(mut entry) = self.keys.get_mut(&key) else {
                        continue;
                    };
                    let state: &mut KeyState = &mut entry;
                    // stale: the key was reset and recreated by another partition
                    if state.owner != owner {
                        continue;
                    }

                    let ready: Vec<i64> = state
                        .open
                        .values()
                        .filter(|w| watermark.has_passed(w.bounds.end_millis()))
                        .map(|w| w.bounds.start_millis())
                        .collect();

                    for start in ready {
                        if let Some(window) = state.open.remove(&start) {
                            let expiry = window.bounds.end_millis().saturating_add(retention);
                            groups.push(seal_window(&key, window, state, retain_sealed)?);
                            if !watermark.has_passed(expiry) {
                                self.schedule(owner, expiry, &key);
                            }
                        }
                    }

                    state.prune(watermark.timestamp, retention);
                    state.is_idle()
                };

                if idle {
                    self.keys.remove_if(&key, |_, state| state.is_idle());
                }
            }
        }

        sort_groups(&mut groups);
        Ok(groups)
    }

    /// Force-seal every open window and release all state
    pub fn flush_all(&self) -> EngineResult<Vec<MeasurementGroup>> {
        let groups = self.force_seal(|_| true)?;
        self.keys.clear();
        self.deadlines.clear();
        info!(groups = groups.len(), "Flushed all open windows");
        Ok(groups)
    }

    /// Force-seal the open windows of keys owned by a partition and release them
    pub fn flush_partition(&self, partition: PartitionId) -> EngineResult<Vec<MeasurementGroup>> {
        let groups = self.force_seal(|owner| owner == partition)?;
        self.keys.retain(|_, state| state.owner != partition);
        self.deadlines.remove(&partition);
        info!(partition, groups = groups.len(), "Flushed partition windows");
        Ok(groups)
    }

    fn force_seal(&self, selected: impl Fn(PartitionId) -> bool) -> EngineResult<Vec<MeasurementGroup>> {
        let mut groups = Vec::new();

        for mut entry in self.keys.iter_mut() {
            let (key, state) = entry.pair_mut();
            if !selected(state.owner) {
                continue;
            }
            let open = std::mem::take(&mut state.open);
            for window in open.into_values() {
                groups.push(seal_window(key, window, state, false)?);
            }
        }

        self.counters.sealed_groups.fetch_add(groups.len() as u64, Ordering::Relaxed);
        sort_groups(&mut groups);
        Ok(groups)
    }

    /// Discard all state owned by a partition, before it replays from its checkpoint
    ///
    /// Returns the number of keys discarded.
    pub fn reset_partition(&self, partition: PartitionId) -> usize {
        let before = self.keys.len();
        self.keys.retain(|_, state| state.owner != partition);
        self.deadlines.remove(&partition);
        self.watermarks.reset(partition);
        let discarded = before.saturating_sub(self.keys.len());
        warn!(partition, discarded, "Reset partition grouping state");
        discarded
    }

    /// Snapshot of engine statistics
    pub fn stats(&self) -> EngineStats {
        let mut stats = EngineStats {
            sealed_groups: self.counters.sealed_groups.load(Ordering::Relaxed),
            late_accepted: self.counters.late_accepted.load(Ordering::Relaxed),
            late_dropped: self.counters.late_dropped.load(Ordering::Relaxed),
            reopened_groups: self.counters.reopened_groups.load(Ordering::Relaxed),
            ..Default::default()
        };

        for entry in self.keys.iter() {
            stats.tracked_keys += 1;
            stats.open_windows += entry.open.len();
            stats.retained_windows += entry.sealed.len();
        }
        for entry in self.deadlines.iter() {
            stats.scheduled_deadlines += entry.len();
        }

        stats
    }
}

#[cfg(test)]
impl GroupingEngine {
    /// Push a measurement into a key's earliest open window, skipping every check
    pub(crate) fn inject_unchecked(&self, key: &GroupKey, measurement: Measurement) -> bool {
        self.keys
            .get_mut(key)
            .map(|mut state| match state.open.values_mut().next() {
                Some(window) => {
                    window.push(measurement);
                    true
                }
                None => false,
            })
            .unwrap_or(false)
    }
}

fn seal_window(
    key: &GroupKey,
    window: OpenWindow,
    state: &mut KeyState,
    retain_sealed: bool,
) -> EngineResult<MeasurementGroup> {
    let OpenWindow {
        bounds,
        measurements,
        revision,
        ..
    } = window;

    let group = MeasurementGroup::sealed(key.clone(), bounds.start, bounds.end, measurements)
        .map_err(EngineStateError::from)?
        .with_revision(revision);

    debug!(
        key = %key,
        window = %bounds,
        measurements = group.len(),
        revision,
        "Sealed window"
    );

    state.mark_sealed(bounds.end_millis());
    if retain_sealed {
        state.sealed.insert(
            bounds.start_millis(),
            SealedWindow {
                bounds,
                measurements: group.measurements().to_vec(),
                revision,
            },
        );
    }

    Ok(group)
}

fn sort_groups(groups: &mut [MeasurementGroup]) {
    groups.sort_by(|a, b| {
        a.window_end()
            .cmp(&b.window_end())
            .then_with(|| a.key().cmp(b.key()))
    });
}
