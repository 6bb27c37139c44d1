//! Device content templates
//!
//! A content template turns a raw device event into zero or more
//! [`Measurement`]s. It has two capabilities:
//! - `matches`: a cheap predicate, never an error
//! - `extract`: build measurements from a matching event, failing with a
//!   [`TemplateExtractionError`] when the payload does not carry what the
//!   template promises
//!
//! Template text is JSON with a `templateType` discriminator. The
//! [`TemplateRegistry`] maps each discriminator to a builder at load time,
//! and a [`TemplateCollection`] evaluates every member template per event.
//!
//! Templates hold no mutable state, so one collection can be shared across
//! partitions behind an `Arc`.

pub mod collection;
pub mod json_content;
pub mod json_path;

pub use collection::{EventMatch, TemplateCollection};
pub use json_content::{JsonPathContentTemplate, TemplateValue};
pub use json_path::JsonPath;

use crate::error::{ExtractionResult, TemplateExtractionError, TemplateParseError, TemplateResult};
use iomt_types::{Measurement, PartitionId, RawEvent};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::{self, Debug};

/// Discriminator of a template collection
pub const COLLECTION_CONTENT: &str = "CollectionContent";
/// Discriminator of a JSON path template
pub const JSON_PATH_CONTENT: &str = "JsonPathContent";
/// Discriminator of a JSON path template with IoT Hub defaults
pub const IOT_JSON_PATH_CONTENT: &str = "IotJsonPathContent";

/// Name and version a template was fetched under
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateSource {
    pub name: String,
    pub version: String,
}

impl TemplateSource {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for TemplateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// A raw event prepared for template evaluation
///
/// The payload is parsed once into the JSON envelope
/// `{ "Body": ..., "Properties": ..., "SystemProperties": ... }` and shared
/// by every template of a collection.
#[derive(Debug)]
pub struct EventContext<'a> {
    event: &'a RawEvent,
    envelope: Value,
}

impl<'a> EventContext<'a> {
    /// Parse the event payload
    pub fn new(event: &'a RawEvent) -> ExtractionResult<Self> {
        let envelope = event
            .to_envelope()
            .map_err(|e| TemplateExtractionError::MalformedPayload {
                partition: event.partition(),
                offset: event.offset(),
                reason: e.to_string(),
            })?;
        Ok(Self { event, envelope })
    }

    pub fn event(&self) -> &RawEvent {
        self.event
    }

    pub fn envelope(&self) -> &Value {
        &self.envelope
    }

    pub fn partition(&self) -> PartitionId {
        self.event.partition()
    }

    pub fn offset(&self) -> i64 {
        self.event.offset()
    }
}

/// Capability interface of a content template
pub trait ContentTemplate: Send + Sync + Debug {
    /// Measure type of every measurement this template produces
    fn type_name(&self) -> &str;

    /// Whether the event has the shape this template handles
    fn matches(&self, ctx: &EventContext<'_>) -> bool;

    /// Extract measurements from a matching event
    ///
    /// A non-matching event yields an empty vector.
    fn extract(&self, ctx: &EventContext<'_>) -> ExtractionResult<Vec<Measurement>>;
}

/// Builds a template from the `template` body of its JSON definition
pub type TemplateBuilder = fn(&Value, &TemplateSource) -> TemplateResult<Box<dyn ContentTemplate>>;

/// Maps `templateType` discriminators to template builders
#[derive(Clone)]
pub struct TemplateRegistry {
    builders: HashMap<String, TemplateBuilder>,
}

impl Debug for TemplateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&String> = self.builders.keys().collect();
        kinds.sort();
        f.debug_struct("TemplateRegistry").field("kinds", &kinds).finish()
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(JSON_PATH_CONTENT, json_content::build_json_path_content);
        registry.register(IOT_JSON_PATH_CONTENT, json_content::build_iot_json_path_content);
        registry
    }
}

impl TemplateRegistry {
    /// Registry without any template kinds
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Register (or replace) a template kind
    pub fn register(&mut self, template_type: impl Into<String>, builder: TemplateBuilder) {
        self.builders.insert(template_type.into(), builder);
    }

    /// Whether a discriminator is known
    pub fn contains(&self, template_type: &str) -> bool {
        self.builders.contains_key(template_type)
    }

    /// Parse template text into a collection
    ///
    /// Accepts either a `CollectionContent` document or a single template,
    /// which becomes a collection of one.
    pub fn load(&self, source: TemplateSource, text: &str) -> TemplateResult<TemplateCollection> {
        let document: Value = serde_json::from_str(text).map_err(|e| TemplateParseError::InvalidJson {
            template: source.to_string(),
            reason: e.to_string(),
        })?;

        let template_type = discriminator(&document, &source)?;
        let body = template_body(&document, &source)?;

        let templates = if template_type == COLLECTION_CONTENT {
            let members = body.as_array().ok_or_else(|| TemplateParseError::Invalid {
                template: source.to_string(),
                reason: "CollectionContent template must be an array".to_string(),
            })?;
            members
                .iter()
                .map(|member| self.build(member, &source))
                .collect::<TemplateResult<Vec<_>>>()?
        } else {
            vec![self.build(&document, &source)?]
        };

        Ok(TemplateCollection::new(source, templates))
    }

    fn build(&self, definition: &Value, source: &TemplateSource) -> TemplateResult<Box<dyn ContentTemplate>> {
        let template_type = discriminator(definition, source)?;
        let builder = self
            .builders
            .get(template_type)
            .ok_or_else(|| TemplateParseError::UnknownTemplateType {
                template: source.to_string(),
                template_type: template_type.to_string(),
            })?;
        builder(template_body(definition, source)?, source)
    }
}

fn discriminator<'v>(definition: &'v Value, source: &TemplateSource) -> TemplateResult<&'v str> {
    definition
        .get("templateType")
        .and_then(Value::as_str)
        .ok_or_else(|| TemplateParseError::MissingField {
            template: source.to_string(),
            field: "templateType".to_string(),
        })
}

fn template_body<'v>(definition: &'v Value, source: &TemplateSource) -> TemplateResult<&'v Value> {
    definition.get("template").ok_or_else(|| TemplateParseError::MissingField {
        template: source.to_string(),
        field: "template".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> TemplateSource {
        TemplateSource::new("devicecontent", "1")
    }

    #[test]
    fn test_load_collection() {
        let text = json!({
            "templateType": "CollectionContent",
            "template": [
                {
                    "templateType": "JsonPathContent",
                    "template": {
                        "typeName": "HeartRate",
                        "typeMatchExpression": "$..[?(@heartRate)]",
                        "deviceIdExpression": "$.deviceId",
                        "timestampExpression": "$.endDate",
                        "values": [{"valueName": "hr", "valueExpression": "$.heartRate", "required": true}]
                    }
                },
                {
                    "templateType": "IotJsonPathContent",
                    "template": {
                        "typeName": "Steps",
                        "typeMatchExpression": "$..[?(@steps)]",
                        "values": [{"valueName": "steps", "valueExpression": "$.steps"}]
                    }
                }
            ]
        })
        .to_string();

        let collection = TemplateRegistry::default().load(source(), &text).unwrap();
        assert_eq!(collection.len(), 2);
        assert_eq!(collection.type_names(), vec!["HeartRate", "Steps"]);
    }

    #[test]
    fn test_load_single_template() {
        let text = json!({
            "templateType": "IotJsonPathContent",
            "template": {"typeName": "Steps", "typeMatchExpression": "$..[?(@steps)]"}
        })
        .to_string();

        let collection = TemplateRegistry::default().load(source(), &text).unwrap();
        assert_eq!(collection.len(), 1);
    }

    #[test]
    fn test_load_rejects_invalid_json() {
        let err = TemplateRegistry::default().load(source(), "{not json").unwrap_err();
        assert!(matches!(err, TemplateParseError::InvalidJson { .. }));
    }

    #[test]
    fn test_load_rejects_unknown_type() {
        let text = json!({"templateType": "FancyContent", "template": {}}).to_string();
        let err = TemplateRegistry::default().load(source(), &text).unwrap_err();
        assert_eq!(
            err,
            TemplateParseError::UnknownTemplateType {
                template: "devicecontent@1".to_string(),
                template_type: "FancyContent".to_string(),
            }
        );
    }

    #[test]
    fn test_load_rejects_missing_discriminator() {
        let text = json!({"template": {}}).to_string();
        let err = TemplateRegistry::default().load(source(), &text).unwrap_err();
        assert!(matches!(err, TemplateParseError::MissingField { ref field, .. } if field == "templateType"));
    }

    #[test]
    fn test_load_rejects_bad_expression_at_load_time() {
        let text = json!({
            "templateType": "JsonPathContent",
            "template": {
                "typeName": "HeartRate",
                "typeMatchExpression": "heartRate",
                "deviceIdExpression": "$.deviceId",
                "timestampExpression": "$.endDate"
            }
        })
        .to_string();
        let err = TemplateRegistry::default().load(source(), &text).unwrap_err();
        assert!(matches!(err, TemplateParseError::InvalidExpression { .. }));
    }

    #[test]
    fn test_custom_registry() {
        let mut registry = TemplateRegistry::empty();
        assert!(!registry.contains(JSON_PATH_CONTENT));
        registry.register(JSON_PATH_CONTENT, json_content::build_json_path_content);
        assert!(registry.contains(JSON_PATH_CONTENT));
    }
}
