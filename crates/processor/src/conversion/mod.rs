//! Conversion stage: sealed groups to FHIR Observations
//!
//! Each conversion template registered for a group's measure type produces
//! one `Observation`. Identifiers are derived from the group key and window
//! start only, so converting the same group again yields the same resources
//! and the sink can upsert them.

pub mod id;
pub mod template;

pub use id::ResourceId;
pub use template::{
    CodeValueTemplate, ComponentMapping, ConversionTemplateCollection, FhirCode, FhirCodeableConcept, ValueKind,
    ValueMapping,
};

use crate::config::ConversionConfig;
use crate::error::{ConversionError, ConversionResult};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use iomt_types::{ClinicalResource, MeasurementGroup};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Resource type of everything the converter produces
pub const OBSERVATION: &str = "Observation";

/// Converts sealed groups with a conversion template collection
#[derive(Debug, Clone)]
pub struct Converter {
    templates: Arc<ConversionTemplateCollection>,
    config: ConversionConfig,
}

impl Converter {
    pub fn new(templates: Arc<ConversionTemplateCollection>, config: ConversionConfig) -> Self {
        Self { templates, config }
    }

    pub fn templates(&self) -> &ConversionTemplateCollection {
        &self.templates
    }

    /// Convert a sealed group into one resource per matching template
    pub fn convert(&self, group: &MeasurementGroup) -> ConversionResult<Vec<ClinicalResource>> {
        let templates: Vec<&CodeValueTemplate> = self.templates.for_measure_type(group.measure_type()).collect();
        if templates.is_empty() {
            return Err(ConversionError::NoTemplate {
                key: group.key().to_string(),
                measure_type: group.measure_type().to_string(),
            });
        }

        let resources = templates
            .iter()
            .enumerate()
            .map(|(ordinal, template)| {
                let discriminator = (ordinal > 0).then(|| format!("{}#{}", template.type_name, ordinal));
                let id = ResourceId::for_group(group.key(), group.window_start(), discriminator.as_deref());
                self.observation(group, template, id)
            })
            .collect::<ConversionResult<Vec<_>>>()?;

        debug!(
            key = %group.key(),
            window_start = %group.window_start(),
            resources = resources.len(),
            "Converted group"
        );

        Ok(resources)
    }

    fn observation(
        &self,
        group: &MeasurementGroup,
        template: &CodeValueTemplate,
        id: ResourceId,
    ) -> ConversionResult<ClinicalResource> {
        let key = group.key();
        let mut observation = Map::new();

        observation.insert("resourceType".into(), json!(OBSERVATION));
        observation.insert("id".into(), json!(id.as_str()));
        observation.insert("status".into(), json!("final"));
        observation.insert(
            "identifier".into(),
            json!([{ "system": self.config.identifier_system, "value": id.as_str() }]),
        );
        if !template.category.is_empty() {
            let category: Vec<Value> = template
                .category
                .iter()
                .map(|c| codeable_concept(&c.codes, c.text.as_deref()))
                .collect();
            observation.insert("category".into(), Value::Array(category));
        }
        observation.insert(
            "code".into(),
            codeable_concept(&template.codes, Some(template.type_name.as_str())),
        );
        if let Some(patient) = &key.patient_id {
            observation.insert("subject".into(), reference("Patient", patient));
        }
        observation.insert("device".into(), reference("Device", &key.device_id));
        if let Some(encounter) = &key.encounter_id {
            observation.insert("encounter".into(), reference("Encounter", encounter));
        }
        observation.insert(
            "effectivePeriod".into(),
            json!({
                "start": fhir_instant(group.window_start()),
                "end": fhir_instant(group.window_end() - Duration::milliseconds(1)),
            }),
        );
        observation.insert("issued".into(), json!(fhir_instant(group.latest_occurrence())));

        if let Some(mapping) = &template.value {
            if let Some((field, value)) = self.value(group, template, mapping)? {
                observation.insert(field.into(), value);
            }
        }

        let mut components = Vec::new();
        for component in &template.components {
            if let Some((field, value)) = self.value(group, template, &component.value)? {
                let mut entry = Map::new();
                entry.insert("code".into(), codeable_concept(&component.codes, None));
                entry.insert(field.into(), value);
                components.push(Value::Object(entry));
            }
        }
        if !components.is_empty() {
            observation.insert("component".into(), Value::Array(components));
        }

        Ok(ClinicalResource {
            resource_type: OBSERVATION.to_string(),
            id: id.into_string(),
            source_key: key.clone(),
            template: template.type_name.clone(),
            payload: Value::Object(observation),
        })
    }

    /// Build `value[x]` for a mapping, `None` when an optional value is absent
    fn value(
        &self,
        group: &MeasurementGroup,
        template: &CodeValueTemplate,
        mapping: &ValueMapping,
    ) -> ConversionResult<Option<(&'static str, Value)>> {
        let readings: Vec<(DateTime<Utc>, &str)> = group
            .measurements()
            .iter()
            .filter_map(|m| m.property(&mapping.value_name).map(|v| (m.occurrence_time_utc(), v)))
            .collect();

        let Some(&(_, latest)) = readings.last() else {
            if mapping.required {
                return Err(ConversionError::MissingRequiredValue {
                    key: group.key().to_string(),
                    template: template.type_name.clone(),
                    value_name: mapping.value_name.clone(),
                });
            }
            return Ok(None);
        };

        let invalid = |value: &str, reason: &str| ConversionError::InvalidValue {
            key: group.key().to_string(),
            template: template.type_name.clone(),
            value_name: mapping.value_name.clone(),
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let built = match &mapping.kind {
            ValueKind::SampledData { period_ms, unit } => {
                let period = period_ms.unwrap_or(self.config.sampled_data_period_ms).max(1);
                let data = sampled_data(group, period, &readings).map_err(|value| invalid(value, "not a number"))?;
                let mut origin = Map::new();
                origin.insert("value".into(), json!(0));
                if let Some(unit) = unit {
                    origin.insert("unit".into(), json!(unit));
                }
                (
                    "valueSampledData",
                    json!({
                        "origin": Value::Object(origin),
                        "period": period,
                        "dimensions": 1,
                        "data": data,
                    }),
                )
            }
            ValueKind::Quantity { unit, system, code } => {
                let number = parse_number(latest).ok_or_else(|| invalid(latest, "not a number"))?;
                let mut quantity = Map::new();
                quantity.insert("value".into(), Value::Number(number));
                for (field, value) in [("unit", unit), ("system", system), ("code", code)] {
                    if let Some(value) = value {
                        quantity.insert(field.into(), json!(value));
                    }
                }
                ("valueQuantity", Value::Object(quantity))
            }
            ValueKind::String => ("valueString", json!(latest)),
            ValueKind::CodeableConcept { codes, text } => (
                "valueCodeableConcept",
                codeable_concept(codes, Some(text.as_deref().unwrap_or(latest))),
            ),
        };

        Ok(Some(built))
    }
}

/// Lay readings on the period grid of the window; empty slots are `E`
///
/// A later reading in the same slot replaces an earlier one. Fails with the
/// offending value when a reading is not numeric.
fn sampled_data<'a>(
    group: &MeasurementGroup,
    period_ms: u64,
    readings: &[(DateTime<Utc>, &'a str)],
) -> Result<String, &'a str> {
    let period = i64::try_from(period_ms).unwrap_or(i64::MAX);
    let window_ms = (group.window_end() - group.window_start()).num_milliseconds();
    let slots = usize::try_from((window_ms + period - 1) / period).unwrap_or(0).max(1);

    let mut data = vec!["E"; slots];
    for &(occurred, value) in readings {
        if parse_number(value).is_none() {
            return Err(value);
        }
        let offset = (occurred - group.window_start()).num_milliseconds() / period;
        if let Some(slot) = usize::try_from(offset).ok().and_then(|i| data.get_mut(i)) {
            *slot = value;
        }
    }

    Ok(data.join(" "))
}

fn parse_number(raw: &str) -> Option<serde_json::Number> {
    serde_json::from_str::<serde_json::Number>(raw.trim()).ok()
}

fn codeable_concept(codes: &[FhirCode], text: Option<&str>) -> Value {
    let mut concept = Map::new();
    if !codes.is_empty() {
        concept.insert("coding".into(), json!(codes));
    }
    if let Some(text) = text {
        concept.insert("text".into(), json!(text));
    }
    Value::Object(concept)
}

fn reference(resource_type: &str, id: &str) -> Value {
    json!({ "reference": format!("{}/{}", resource_type, id) })
}

fn fhir_instant(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
