//! FHIR conversion templates (`CodeValueFhir`, `CollectionFhir`)
//!
//! ```json
//! {
//!   "templateType": "CollectionFhir",
//!   "template": [{
//!     "templateType": "CodeValueFhir",
//!     "template": {
//!       "typeName": "HeartRate",
//!       "codes": [{ "code": "8867-4", "system": "http://loinc.org", "display": "Heart rate" }],
//!       "value": { "valueName": "hr", "valueType": "SampledData", "defaultPeriod": 5000, "unit": "count/min" }
//!     }
//!   }]
//! }
//! ```

use crate::error::{TemplateParseError, TemplateResult};
use crate::template::TemplateSource;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminator of a conversion template collection
pub const COLLECTION_FHIR: &str = "CollectionFhir";
/// Discriminator of a code/value conversion template
pub const CODE_VALUE_FHIR: &str = "CodeValueFhir";

/// A FHIR coding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FhirCode {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

/// A FHIR codeable concept
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FhirCodeableConcept {
    #[serde(default)]
    pub codes: Vec<FhirCode>,
    #[serde(default)]
    pub text: Option<String>,
}

/// How measurement values become a FHIR value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueKind {
    /// Every reading placed on a fixed-period grid over the window
    SampledData {
        period_ms: Option<u64>,
        unit: Option<String>,
    },
    /// Latest reading as a numeric quantity
    Quantity {
        unit: Option<String>,
        system: Option<String>,
        code: Option<String>,
    },
    /// Latest reading verbatim
    String,
    /// Latest reading as the text of a coded concept
    CodeableConcept {
        codes: Vec<FhirCode>,
        text: Option<String>,
    },
}

/// Maps one measurement property to a FHIR value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueMapping {
    pub value_name: String,
    pub required: bool,
    pub kind: ValueKind,
}

/// An Observation component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentMapping {
    pub codes: Vec<FhirCode>,
    pub value: ValueMapping,
}

/// Builds one Observation per sealed group of a measure type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeValueTemplate {
    pub type_name: String,
    pub codes: Vec<FhirCode>,
    pub category: Vec<FhirCodeableConcept>,
    pub value: Option<ValueMapping>,
    pub components: Vec<ComponentMapping>,
}

/// Ordered conversion templates fetched under one name and version
#[derive(Debug, Clone)]
pub struct ConversionTemplateCollection {
    source: TemplateSource,
    templates: Vec<CodeValueTemplate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValueDefinition {
    value_name: Option<String>,
    value_type: Option<String>,
    #[serde(default = "default_required")]
    required: bool,
    default_period: Option<u64>,
    unit: Option<String>,
    system: Option<String>,
    code: Option<String>,
    #[serde(default)]
    codes: Vec<FhirCode>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComponentDefinition {
    #[serde(default)]
    codes: Vec<FhirCode>,
    value: Option<ValueDefinition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CodeValueDefinition {
    type_name: Option<String>,
    #[serde(default)]
    codes: Vec<FhirCode>,
    #[serde(default)]
    category: Vec<FhirCodeableConcept>,
    value: Option<ValueDefinition>,
    #[serde(default)]
    components: Vec<ComponentDefinition>,
}

fn default_required() -> bool {
    true
}

impl ConversionTemplateCollection {
    pub fn new(source: TemplateSource, templates: Vec<CodeValueTemplate>) -> Self {
        Self { source, templates }
    }

    /// Parse conversion template text
    ///
    /// Accepts a `CollectionFhir` document or a single `CodeValueFhir` template.
    pub fn load(source: TemplateSource, text: &str) -> TemplateResult<Self> {
        let document: Value = serde_json::from_str(text).map_err(|e| TemplateParseError::InvalidJson {
            template: source.to_string(),
            reason: e.to_string(),
        })?;

        let templates = match template_type(&document, &source)? {
            COLLECTION_FHIR => template_body(&document, &source)?
                .as_array()
                .ok_or_else(|| invalid(&source, "CollectionFhir template must be an array"))?
                .iter()
                .map(|member| parse_member(member, &source))
                .collect::<TemplateResult<Vec<_>>>()?,
            _ => vec![parse_member(&document, &source)?],
        };

        Ok(Self::new(source, templates))
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

    /// Templates converting a measure type, in collection order
    pub fn for_measure_type<'a>(&'a self, measure_type: &'a str) -> impl Iterator<Item = &'a CodeValueTemplate> + 'a {
        self.templates.iter().filter(move |t| t.type_name == measure_type)
    }
}

fn invalid(source: &TemplateSource, reason: impl Into<String>) -> TemplateParseError {
    TemplateParseError::Invalid {
        template: source.to_string(),
        reason: reason.into(),
    }
}

fn missing(source: &TemplateSource, field: &str) -> TemplateParseError {
    TemplateParseError::MissingField {
        template: source.to_string(),
        field: field.to_string(),
    }
}

fn template_type<'v>(definition: &'v Value, source: &TemplateSource) -> TemplateResult<&'v str> {
    definition
        .get("templateType")
        .and_then(Value::as_str)
        .ok_or_else(|| missing(source, "templateType"))
}

fn template_body<'v>(definition: &'v Value, source: &TemplateSource) -> TemplateResult<&'v Value> {
    definition.get("template").ok_or_else(|| missing(source, "template"))
}

fn parse_member(definition: &Value, source: &TemplateSource) -> TemplateResult<CodeValueTemplate> {
    let kind = template_type(definition, source)?;
    if kind != CODE_VALUE_FHIR {
        return Err(TemplateParseError::UnknownTemplateType {
            template: source.to_string(),
            template_type: kind.to_string(),
        });
    }

    let parsed: CodeValueDefinition = serde_json::from_value(template_body(definition, source)?.clone())
        .map_err(|e| invalid(source, e.to_string()))?;

    let type_name = parsed
        .type_name
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| missing(source, "typeName"))?;

    let value = parsed.value.map(|v| parse_value(v, source)).transpose()?;
    let components = parsed
        .components
        .into_iter()
        .map(|component| {
            let value = component.value.ok_or_else(|| missing(source, "components[].value"))?;
            Ok(ComponentMapping {
                codes: component.codes,
                value: parse_value(value, source)?,
            })
        })
        .collect::<TemplateResult<Vec<_>>>()?;

    if value.is_none() && components.is_empty() {
        return Err(invalid(
            source,
            format!("template '{}' maps neither a value nor components", type_name),
        ));
    }

    Ok(CodeValueTemplate {
        type_name,
        codes: parsed.codes,
        category: parsed.category,
        value,
        components,
    })
}

fn parse_value(definition: ValueDefinition, source: &TemplateSource) -> TemplateResult<ValueMapping> {
    let value_name = definition
        .value_name
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| missing(source, "valueName"))?;
    let value_type = definition.value_type.ok_or_else(|| missing(source, "valueType"))?;

    let kind = match value_type.as_str() {
        "SampledData" => {
            if definition.default_period == Some(0) {
                return Err(invalid(source, format!("value '{}' has a zero defaultPeriod", value_name)));
            }
            ValueKind::SampledData {
                period_ms: definition.default_period,
                unit: definition.unit,
            }
        }
        "Quantity" => ValueKind::Quantity {
            unit: definition.unit,
            system: definition.system,
            code: definition.code,
        },
        "String" => ValueKind::String,
        "CodeableConcept" => ValueKind::CodeableConcept {
            codes: definition.codes,
            text: definition.text,
        },
        other => {
            return Err(invalid(
                source,
                format!("value '{}' has unknown valueType '{}'", value_name, other),
            ))
        }
    };

    Ok(ValueMapping {
        value_name,
        required: definition.required,
        kind,
    })
}
