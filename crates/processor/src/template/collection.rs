//! Ordered template collections

use super::{ContentTemplate, EventContext, TemplateSource};
use crate::error::ExtractionResult;
use iomt_types::Measurement;

/// Result of evaluating a collection against one event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventMatch {
    /// Number of templates that matched the event
    pub matched_templates: usize,
    /// Measurements of every matching template, in collection order
    pub measurements: Vec<Measurement>,
}

impl EventMatch {
    /// No template matched the event
    pub fn is_unmapped(&self) -> bool {
        self.matched_templates == 0
    }
}

/// Ordered list of content templates, all evaluated against every event
#[derive(Debug)]
pub struct TemplateCollection {
    source: TemplateSource,
    templates: Vec<Box<dyn ContentTemplate>>,
}

impl TemplateCollection {
    pub fn new(source: TemplateSource, templates: Vec<Box<dyn ContentTemplate>>) -> Self {
        Self { source, templates }
    }

    pub fn source(&self) -> &TemplateSource {
        &self.source
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Measure types of the member templates, in order
    pub fn type_names(&self) -> Vec<&str> {
        self.templates.iter().map(|t| t.type_name()).collect()
    }

    /// Evaluate every template against the event and concatenate the results
    ///
    /// One event can produce measurements of several measure types. The first
    /// extraction error fails the whole event.
    pub fn evaluate(&self, ctx: &EventContext<'_>) -> ExtractionResult<EventMatch> {
        let mut result = EventMatch::default();

        for template in self.templates.iter().filter(|t| t.matches(ctx)) {
            result.matched_templates += 1;
            result.measurements.extend(template.extract(ctx)?);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TemplateRegistry;
    use chrono::{TimeZone, Utc};
    use iomt_types::{RawEvent, SystemProperties};
    use serde_json::json;

    fn collection() -> TemplateCollection {
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
                    "templateType": "JsonPathContent",
                    "template": {
                        "typeName": "Steps",
                        "typeMatchExpression": "$..[?(@steps)]",
                        "deviceIdExpression": "$.deviceId",
                        "timestampExpression": "$.endDate",
                        "values": [{"valueName": "steps", "valueExpression": "$.steps", "required": true}]
                    }
                }
            ]
        })
        .to_string();
        TemplateRegistry::default()
            .load(TemplateSource::new("devicecontent", "1"), &text)
            .unwrap()
    }

    fn event(body: serde_json::Value) -> RawEvent {
        RawEvent::new(
            0,
            body.to_string(),
            SystemProperties::new(1, 1, Utc.timestamp_millis_opt(0).unwrap()),
        )
    }

    #[test]
    fn test_every_template_is_evaluated() {
        let raw = event(json!({
            "heartRate": 80,
            "steps": 12,
            "deviceId": "dev-1",
            "endDate": "2024-01-01T00:00:00Z"
        }));
        let ctx = EventContext::new(&raw).unwrap();

        let result = collection().evaluate(&ctx).unwrap();
        assert_eq!(result.matched_templates, 2);
        let types: Vec<_> = result.measurements.iter().map(|m| m.measure_type()).collect();
        assert_eq!(types, vec!["HeartRate", "Steps"]);
    }

    #[test]
    fn test_unmapped_event() {
        let raw = event(json!({"hr": 72}));
        let ctx = EventContext::new(&raw).unwrap();

        let result = collection().evaluate(&ctx).unwrap();
        assert!(result.is_unmapped());
        assert!(result.measurements.is_empty());
    }

    #[test]
    fn test_extraction_error_fails_event() {
        let raw = event(json!({"heartRate": 80, "endDate": "2024-01-01T00:00:00Z"}));
        let ctx = EventContext::new(&raw).unwrap();

        assert!(collection().evaluate(&ctx).is_err());
    }
}
