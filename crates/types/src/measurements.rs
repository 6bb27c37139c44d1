//! Normalized measurements and the groups they are aggregated into

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{ModelError, Result};

/// A named value extracted from a device payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementProperty {
    pub name: String,
    pub value: String,
}

impl MeasurementProperty {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A single typed reading produced by the normalizer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    measure_type: String,
    device_id: String,
    patient_id: Option<String>,
    encounter_id: Option<String>,
    correlation_id: Option<String>,
    occurrence_time_utc: DateTime<Utc>,
    properties: Vec<MeasurementProperty>,
}

impl Measurement {
    /// Create a measurement with no properties
    pub fn new(
        measure_type: impl Into<String>,
        device_id: impl Into<String>,
        occurrence_time_utc: DateTime<Utc>,
    ) -> Self {
        Self {
            measure_type: measure_type.into(),
            device_id: device_id.into(),
            patient_id: None,
            encounter_id: None,
            correlation_id: None,
            occurrence_time_utc,
            properties: Vec::new(),
        }
    }

    pub fn with_patient_id(mut self, patient_id: Option<String>) -> Self {
        self.patient_id = patient_id;
        self
    }

    pub fn with_encounter_id(mut self, encounter_id: Option<String>) -> Self {
        self.encounter_id = encounter_id;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Append a property, preserving insertion order
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push(MeasurementProperty::new(name, value));
        self
    }

    pub fn measure_type(&self) -> &str {
        &self.measure_type
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn patient_id(&self) -> Option<&str> {
        self.patient_id.as_deref()
    }

    pub fn encounter_id(&self) -> Option<&str> {
        self.encounter_id.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn occurrence_time_utc(&self) -> DateTime<Utc> {
        self.occurrence_time_utc
    }

    pub fn properties(&self) -> &[MeasurementProperty] {
        &self.properties
    }

    /// First value recorded under `name`
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    /// Grouping key of this measurement
    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            measure_type: self.measure_type.clone(),
            device_id: self.device_id.clone(),
            patient_id: self.patient_id.clone(),
            encounter_id: self.encounter_id.clone(),
            correlation_id: self.correlation_id.clone(),
        }
    }
}

/// Key that measurements are aggregated under
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub measure_type: String,
    pub device_id: String,
    pub patient_id: Option<String>,
    pub encounter_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl GroupKey {
    /// Key fields in a fixed order, with absent fields as empty strings
    pub fn parts(&self) -> [&str; 5] {
        [
            &self.measure_type,
            &self.device_id,
            self.patient_id.as_deref().unwrap_or(""),
            self.encounter_id.as_deref().unwrap_or(""),
            self.correlation_id.as_deref().unwrap_or(""),
        ]
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.parts().join("|"))
    }
}

/// Measurements sharing a key and one aggregation window
///
/// Groups are only ever constructed sealed: the grouping engine keeps the
/// mutable accumulation state and hands over an immutable group on sealing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementGroup {
    key: GroupKey,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    measurements: Vec<Measurement>,
    revision: u32,
}

impl MeasurementGroup {
    /// Seal a set of measurements into a group
    ///
    /// Measurements are ordered by occurrence time; arrival order breaks ties.
    /// Fails when a measurement does not share the key or falls outside
    /// `[window_start, window_end)`.
    pub fn sealed(
        key: GroupKey,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        mut measurements: Vec<Measurement>,
    ) -> Result<Self> {
        if window_start >= window_end {
            return Err(ModelError::InvalidGroup {
                key: key.to_string(),
                reason: format!("window start {} is not before end {}", window_start, window_end),
            });
        }

        if measurements.is_empty() {
            return Err(ModelError::InvalidGroup {
                key: key.to_string(),
                reason: "group has no measurements".to_string(),
            });
        }

        for measurement in &measurements {
            if measurement.group_key() != key {
                return Err(ModelError::InvalidGroup {
                    key: key.to_string(),
                    reason: format!("measurement keyed {} does not belong", measurement.group_key()),
                });
            }
            let ts = measurement.occurrence_time_utc();
            if ts < window_start || ts >= window_end {
                return Err(ModelError::InvalidGroup {
                    key: key.to_string(),
                    reason: format!(
                        "measurement at {} outside window [{}, {})",
                        ts.to_rfc3339_opts(SecondsFormat::Millis, true),
                        window_start.to_rfc3339_opts(SecondsFormat::Millis, true),
                        window_end.to_rfc3339_opts(SecondsFormat::Millis, true),
                    ),
                });
            }
        }

        measurements.sort_by_key(|m| m.occurrence_time_utc());

        Ok(Self {
            key,
            window_start,
            window_end,
            measurements,
            revision: 0,
        })
    }

    /// Mark this group as a re-emission of an earlier sealed window
    pub fn with_revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }

    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    pub fn measure_type(&self) -> &str {
        &self.key.measure_type
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.window_start
    }

    pub fn window_end(&self) -> DateTime<Utc> {
        self.window_end
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// Number of times this window has been re-emitted after late data
    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// Latest occurrence time in the group
    pub fn latest_occurrence(&self) -> DateTime<Utc> {
        self.measurements
            .last()
            .map(Measurement::occurrence_time_utc)
            .unwrap_or(self.window_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn hr(secs: i64, value: &str) -> Measurement {
        Measurement::new("HeartRate", "dev-1", ts(secs))
            .with_patient_id(Some("pat-1".to_string()))
            .with_property("hr", value)
    }

    #[test]
    fn test_group_orders_by_occurrence() {
        let key = hr(0, "0").group_key();
        let group = MeasurementGroup::sealed(key, ts(0), ts(60), vec![hr(50, "b"), hr(10, "a")]).unwrap();

        let values: Vec<_> = group.measurements().iter().map(|m| m.property("hr").unwrap()).collect();
        assert_eq!(values, vec!["a", "b"]);
        assert_eq!(group.latest_occurrence(), ts(50));
    }

    #[test]
    fn test_group_rejects_window_end() {
        let key = hr(0, "0").group_key();
        let err = MeasurementGroup::sealed(key, ts(0), ts(60), vec![hr(60, "x")]).unwrap_err();
        assert!(matches!(err, ModelError::InvalidGroup { .. }));
    }

    #[test]
    fn test_group_rejects_foreign_key() {
        let key = hr(0, "0").group_key();
        let other = Measurement::new("HeartRate", "dev-2", ts(5));
        assert!(MeasurementGroup::sealed(key, ts(0), ts(60), vec![other]).is_err());
    }

    #[test]
    fn test_key_display() {
        let key = hr(0, "0").group_key();
        assert_eq!(key.to_string(), "HeartRate|dev-1|pat-1||");
    }
}
