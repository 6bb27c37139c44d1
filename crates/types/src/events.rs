//! Raw device events as delivered by the event source

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of an event source partition
pub type PartitionId = u32;

/// Well-known system property names, as exposed to templates
pub mod system_property_names {
    pub const PARTITION_KEY: &str = "x-opt-partition-key";
    pub const SEQUENCE_NUMBER: &str = "x-opt-sequence-number";
    pub const OFFSET: &str = "x-opt-offset";
    pub const ENQUEUED_TIME: &str = "x-opt-enqueued-time";
    pub const DEVICE_ID: &str = "iothub-connection-device-id";
}

/// Application property holding the event type label used by telemetry
pub const EVENT_TYPE_PROPERTY: &str = "eventType";

/// Primitive value of an application or system property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl PropertyValue {
    /// Convert the property into a JSON value for template evaluation
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PropertyValue::Null => serde_json::Value::Null,
            PropertyValue::Bool(b) => serde_json::Value::Bool(*b),
            PropertyValue::Int(i) => serde_json::Value::from(*i),
            PropertyValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            PropertyValue::String(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Encoded size of the value in bytes
    pub fn encoded_len(&self) -> usize {
        match self {
            PropertyValue::Null => 0,
            PropertyValue::Bool(_) => 1,
            PropertyValue::Int(_) | PropertyValue::Float(_) => 8,
            PropertyValue::String(s) => s.len(),
        }
    }

    /// Borrow the value as a string slice when it is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Null => write!(f, "null"),
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Int(i) => write!(f, "{}", i),
            PropertyValue::Float(v) => write!(f, "{}", v),
            PropertyValue::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        PropertyValue::Int(i)
    }
}

impl From<f64> for PropertyValue {
    fn from(f: f64) -> Self {
        PropertyValue::Float(f)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

/// Transport-level properties stamped on every event by the event source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemProperties {
    /// Partition key the producer used, if any
    pub partition_key: Option<String>,
    /// Monotonic sequence number within the partition
    pub sequence_number: i64,
    /// Offset of the event within the partition
    pub offset: i64,
    /// Time the event source accepted the event
    pub enqueued_time: DateTime<Utc>,
    /// Any further transport properties (device id, content type, ...)
    #[serde(default)]
    pub other: BTreeMap<String, PropertyValue>,
}

impl SystemProperties {
    /// Create system properties with the mandatory fields
    pub fn new(sequence_number: i64, offset: i64, enqueued_time: DateTime<Utc>) -> Self {
        Self {
            partition_key: None,
            sequence_number,
            offset,
            enqueued_time,
            other: BTreeMap::new(),
        }
    }

    /// Set the partition key
    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Add a further transport property
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.other.insert(name.into(), value.into());
        self
    }

    /// Flatten into the name/value view templates see
    pub fn to_map(&self) -> BTreeMap<String, PropertyValue> {
        use system_property_names::*;

        let mut map = self.other.clone();
        if let Some(key) = &self.partition_key {
            map.insert(PARTITION_KEY.to_string(), PropertyValue::String(key.clone()));
        }
        map.insert(SEQUENCE_NUMBER.to_string(), PropertyValue::Int(self.sequence_number));
        map.insert(OFFSET.to_string(), PropertyValue::Int(self.offset));
        map.insert(
            ENQUEUED_TIME.to_string(),
            PropertyValue::String(self.enqueued_time.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        map
    }

    fn encoded_len(&self) -> usize {
        self.to_map()
            .iter()
            .map(|(k, v)| k.len() + v.encoded_len())
            .sum()
    }
}

/// A raw telemetry event exactly as received from the event source
///
/// Immutable once constructed: there are builder methods but no mutators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    partition: PartitionId,
    payload: Vec<u8>,
    properties: BTreeMap<String, PropertyValue>,
    system_properties: SystemProperties,
}

impl RawEvent {
    /// Create a new raw event
    pub fn new(partition: PartitionId, payload: impl Into<Vec<u8>>, system_properties: SystemProperties) -> Self {
        Self {
            partition,
            payload: payload.into(),
            properties: BTreeMap::new(),
            system_properties,
        }
    }

    /// Add an application property
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn system_properties(&self) -> &SystemProperties {
        &self.system_properties
    }

    pub fn offset(&self) -> i64 {
        self.system_properties.offset
    }

    pub fn enqueued_time(&self) -> DateTime<Utc> {
        self.system_properties.enqueued_time
    }

    /// Event type label used to bucket telemetry
    pub fn event_type(&self) -> &str {
        self.property(EVENT_TYPE_PROPERTY)
            .and_then(PropertyValue::as_str)
            .unwrap_or("unknown")
    }

    /// Total size of payload and properties in bytes
    pub fn size_bytes(&self) -> u64 {
        let properties: usize = self
            .properties
            .iter()
            .map(|(k, v)| k.len() + v.encoded_len())
            .sum();
        (self.payload.len() + properties + self.system_properties.encoded_len()) as u64
    }

    /// Parse the payload as JSON; an empty payload is `null`
    pub fn payload_json(&self) -> std::result::Result<serde_json::Value, serde_json::Error> {
        if self.payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(&self.payload)
    }

    /// Build the `{ Body, Properties, SystemProperties }` document templates evaluate against
    pub fn to_envelope(&self) -> std::result::Result<serde_json::Value, serde_json::Error> {
        let body = self.payload_json()?;
        let properties: serde_json::Map<String, serde_json::Value> = self
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        let system: serde_json::Map<String, serde_json::Value> = self
            .system_properties
            .to_map()
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();

        Ok(serde_json::json!({
            "Body": body,
            "Properties": properties,
            "SystemProperties": system,
        }))
    }
}
