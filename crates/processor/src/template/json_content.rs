//! JSON path content templates (`JsonPathContent`, `IotJsonPathContent`)

use super::{ContentTemplate, EventContext, JsonPath, TemplateSource};
use crate::error::{ExtractionResult, TemplateExtractionError, TemplateParseError, TemplateResult};
use chrono::{DateTime, NaiveDateTime, Utc};
use iomt_types::events::system_property_names;
use iomt_types::Measurement;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonPathContentDefinition {
    type_name: Option<String>,
    type_match_expression: Option<String>,
    device_id_expression: Option<String>,
    timestamp_expression: Option<String>,
    patient_id_expression: Option<String>,
    encounter_id_expression: Option<String>,
    correlation_id_expression: Option<String>,
    #[serde(default)]
    values: Vec<ValueDefinition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValueDefinition {
    value_name: Option<String>,
    value_expression: Option<String>,
    #[serde(default)]
    required: bool,
}

/// One named value read from a matched node
#[derive(Debug, Clone)]
pub struct TemplateValue {
    pub name: String,
    pub expression: JsonPath,
    pub required: bool,
}

/// Where the occurrence time of a measurement comes from
#[derive(Debug, Clone)]
enum TimestampSource {
    Expression(JsonPath),
    EnqueuedTime,
}

/// Template that selects nodes with `typeMatchExpression` and reads the
/// measurement fields from each selected node
///
/// Field expressions are evaluated against the matched node first and fall
/// back to the whole event envelope, so `$.heartRate` reads a field of the
/// node while `$.SystemProperties.x-opt-enqueued-time` still resolves.
#[derive(Debug, Clone)]
pub struct JsonPathContentTemplate {
    source: TemplateSource,
    type_name: String,
    type_match: JsonPath,
    device_id: JsonPath,
    timestamp: TimestampSource,
    patient_id: Option<JsonPath>,
    encounter_id: Option<JsonPath>,
    correlation_id: Option<JsonPath>,
    values: Vec<TemplateValue>,
}

impl JsonPathContentTemplate {
    pub fn source(&self) -> &TemplateSource {
        &self.source
    }

    pub fn values(&self) -> &[TemplateValue] {
        &self.values
    }

    fn missing(&self, ctx: &EventContext<'_>, field: &str) -> TemplateExtractionError {
        TemplateExtractionError::MissingField {
            template: self.type_name.clone(),
            field: field.to_string(),
            partition: ctx.partition(),
            offset: ctx.offset(),
        }
    }

    /// Resolve an expression to a scalar string, node first then envelope
    fn scalar(
        &self,
        ctx: &EventContext<'_>,
        node: &Value,
        path: &JsonPath,
        field: &str,
    ) -> ExtractionResult<Option<String>> {
        let found = path.first(node).or_else(|| path.first(ctx.envelope()));
        match found {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(_) => Err(TemplateExtractionError::NonScalarValue {
                template: self.type_name.clone(),
                field: field.to_string(),
                partition: ctx.partition(),
                offset: ctx.offset(),
            }),
        }
    }

    fn optional(
        &self,
        ctx: &EventContext<'_>,
        node: &Value,
        path: Option<&JsonPath>,
        field: &str,
    ) -> ExtractionResult<Option<String>> {
        match path {
            Some(path) => self.scalar(ctx, node, path, field),
            None => Ok(None),
        }
    }

    fn occurrence_time(&self, ctx: &EventContext<'_>, node: &Value) -> ExtractionResult<DateTime<Utc>> {
        match &self.timestamp {
            TimestampSource::EnqueuedTime => Ok(ctx.event().enqueued_time()),
            TimestampSource::Expression(path) => {
                let raw = self
                    .scalar(ctx, node, path, "timestamp")?
                    .ok_or_else(|| self.missing(ctx, "timestamp"))?;
                parse_timestamp(&raw).ok_or_else(|| TemplateExtractionError::InvalidTimestamp {
                    template: self.type_name.clone(),
                    value: raw,
                    partition: ctx.partition(),
                    offset: ctx.offset(),
                })
            }
        }
    }

    fn measurement(&self, ctx: &EventContext<'_>, node: &Value) -> ExtractionResult<Measurement> {
        let device_id = self
            .scalar(ctx, node, &self.device_id, "deviceId")?
            .ok_or_else(|| self.missing(ctx, "deviceId"))?;
        let occurrence = self.occurrence_time(ctx, node)?;

        let mut measurement = Measurement::new(&self.type_name, device_id, occurrence)
            .with_patient_id(self.optional(ctx, node, self.patient_id.as_ref(), "patientId")?)
            .with_encounter_id(self.optional(ctx, node, self.encounter_id.as_ref(), "encounterId")?)
            .with_correlation_id(self.optional(ctx, node, self.correlation_id.as_ref(), "correlationId")?);

        for value in &self.values {
            match self.scalar(ctx, node, &value.expression, &value.name)? {
                Some(v) => measurement = measurement.with_property(&value.name, v),
                None if value.required => return Err(self.missing(ctx, &value.name)),
                None => {}
            }
        }

        Ok(measurement)
    }
}

impl ContentTemplate for JsonPathContentTemplate {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn matches(&self, ctx: &EventContext<'_>) -> bool {
        self.type_match.first(ctx.envelope()).is_some()
    }

    fn extract(&self, ctx: &EventContext<'_>) -> ExtractionResult<Vec<Measurement>> {
        self.type_match
            .select(ctx.envelope())
            .into_iter()
            .filter(|node| !node.is_null())
            .map(|node| self.measurement(ctx, node))
            .collect()
    }
}

/// Parse an RFC 3339 timestamp, or a naive ISO 8601 one taken as UTC
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn missing_field(field: &str, source: &TemplateSource) -> TemplateParseError {
    TemplateParseError::MissingField {
        template: source.to_string(),
        field: field.to_string(),
    }
}

fn required_field(value: Option<String>, field: &str, source: &TemplateSource) -> TemplateResult<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| missing_field(field, source))
}

fn compile(expression: &str, source: &TemplateSource) -> TemplateResult<JsonPath> {
    JsonPath::parse(expression).map_err(|reason| TemplateParseError::InvalidExpression {
        template: source.to_string(),
        expression: expression.to_string(),
        reason,
    })
}

fn compile_optional(expression: Option<String>, source: &TemplateSource) -> TemplateResult<Option<JsonPath>> {
    expression.map(|e| compile(&e, source)).transpose()
}

fn build(body: &Value, source: &TemplateSource, iot_defaults: bool) -> TemplateResult<JsonPathContentTemplate> {
    let definition: JsonPathContentDefinition =
        serde_json::from_value(body.clone()).map_err(|e| TemplateParseError::Invalid {
            template: source.to_string(),
            reason: e.to_string(),
        })?;

    let type_name = required_field(definition.type_name, "typeName", source)?;
    let type_match = compile(
        &required_field(definition.type_match_expression, "typeMatchExpression", source)?,
        source,
    )?;

    let device_id = match definition.device_id_expression {
        Some(expr) => compile(&expr, source)?,
        None if iot_defaults => compile(
            &format!("$.SystemProperties.{}", system_property_names::DEVICE_ID),
            source,
        )?,
        None => return Err(missing_field("deviceIdExpression", source)),
    };

    let timestamp = match definition.timestamp_expression {
        Some(expr) => TimestampSource::Expression(compile(&expr, source)?),
        None if iot_defaults => TimestampSource::EnqueuedTime,
        None => return Err(missing_field("timestampExpression", source)),
    };

    let values = definition
        .values
        .into_iter()
        .map(|value| {
            let name = required_field(value.value_name, "valueName", source)?;
            let expression = compile(&required_field(value.value_expression, "valueExpression", source)?, source)?;
            Ok(TemplateValue {
                name,
                expression,
                required: value.required,
            })
        })
        .collect::<TemplateResult<Vec<_>>>()?;

    Ok(JsonPathContentTemplate {
        source: source.clone(),
        type_name,
        type_match,
        device_id,
        timestamp,
        patient_id: compile_optional(definition.patient_id_expression, source)?,
        encounter_id: compile_optional(definition.encounter_id_expression, source)?,
        correlation_id: compile_optional(definition.correlation_id_expression, source)?,
        values,
    })
}

/// Builder registered for `JsonPathContent`
pub fn build_json_path_content(
    body: &Value,
    source: &TemplateSource,
) -> TemplateResult<Box<dyn ContentTemplate>> {
    Ok(Box::new(build(body, source, false)?))
}

/// Builder registered for `IotJsonPathContent`
pub fn build_iot_json_path_content(
    body: &Value,
    source: &TemplateSource,
) -> TemplateResult<Box<dyn ContentTemplate>> {
    Ok(Box::new(build(body, source, true)?))
}
