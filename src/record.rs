//! Record normalization: projecting a tap record onto a flattened
//! schema and rendering it as an ordered CSV row.
//!
//! Field order follows [`FlattenedSchema::ordered_columns`]. NULL is the
//! empty field (the COPY runs with `EMPTYASNULL`), and backslashes are
//! doubled because the COPY runs with `ESCAPE`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;
use snafu::prelude::*;
use std::sync::Arc;

use crate::error::{InvalidDateTimeSnafu, RecordError, RecordNotAnObjectSnafu};
use crate::message::RecordMessage;
use crate::schema::{ColumnType, FlattenedSchema};

/// Normalizes records of one stream against its flattened schema.
#[derive(Debug, Clone)]
pub struct RecordNormalizer {
    stream: String,
    schema: Arc<FlattenedSchema>,
    validate_records: bool,
}

impl RecordNormalizer {
    pub fn new(stream: impl Into<String>, schema: Arc<FlattenedSchema>, validate_records: bool) -> Self {
        Self {
            stream: stream.into(),
            schema,
            validate_records,
        }
    }

    /// Produce the ordered CSV field values for one record.
    ///
    /// `sequence` is the monotonically increasing message index and
    /// `table_version` the stream's active version, both of which only
    /// materialize when metadata columns are enabled.
    pub fn normalize(
        &self,
        msg: &RecordMessage,
        sequence: u64,
        table_version: Option<i64>,
    ) -> Result<Vec<String>, RecordError> {
        let record = msg.record.as_object().context(RecordNotAnObjectSnafu {
            stream: self.stream.clone(),
        })?;

        let mut fields =
            Vec::with_capacity(self.schema.columns().len() + if self.schema.with_metadata() { 6 } else { 0 });

        if self.schema.with_metadata() {
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
            fields.push(
                msg.time_extracted
                    .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Micros, true))
                    .unwrap_or_default(),
            );
            fields.push(now.clone());
            fields.push(now);
            fields.push(
                record
                    .get("_sdc_deleted_at")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            );
            fields.push(sequence.to_string());
            fields.push(table_version.map(|v| v.to_string()).unwrap_or_default());
        }

        for column in self.schema.columns() {
            let mut value = Some(&msg.record);
            for segment in &column.path {
                value = value.and_then(|v| v.get(segment));
            }
            let field = match value {
                None => String::new(),
                Some(value) => self.render(&column.name, column.column_type, value)?,
            };
            fields.push(field);
        }

        // The COPY runs with ESCAPE: literal backslashes must be doubled.
        for field in &mut fields {
            if field.contains('\\') {
                *field = field.replace('\\', "\\\\");
            }
        }

        Ok(fields)
    }

    fn render(
        &self,
        column: &str,
        column_type: ColumnType,
        value: &Value,
    ) -> Result<String, RecordError> {
        if value.is_null() {
            return Ok(String::new());
        }

        let field = match column_type {
            ColumnType::Super => match value {
                Value::Object(_) | Value::Array(_) => serde_json::to_string(value)
                    .expect("JSON value serialization cannot fail"),
                other => plain_text(other),
            },
            ColumnType::Timestamp => {
                let raw = value.as_str().unwrap_or_default();
                if is_valid_timestamp(raw) {
                    raw.to_string()
                } else if self.validate_records {
                    return InvalidDateTimeSnafu {
                        stream: self.stream.clone(),
                        column,
                        value: plain_text(value),
                    }
                    .fail();
                } else {
                    String::new()
                }
            }
            ColumnType::Float | ColumnType::Numeric => match value {
                Value::Number(n) => {
                    // Non-finite floats cannot round-trip through COPY.
                    if n.as_f64().is_some_and(f64::is_finite) || n.is_i64() || n.is_u64() {
                        n.to_string()
                    } else {
                        String::new()
                    }
                }
                other => plain_text(other),
            },
            _ => plain_text(value),
        };

        Ok(field)
    }
}

fn plain_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        container => {
            serde_json::to_string(container).expect("JSON value serialization cannot fail")
        }
    }
}

fn is_valid_timestamp(raw: &str) -> bool {
    !raw.is_empty()
        && (DateTime::parse_from_rfc3339(raw).is_ok()
            || NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
            || NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").is_ok()
            || NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok())
}
