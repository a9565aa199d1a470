//! Tap protocol message decoding.
//!
//! The input is newline-delimited JSON, one message per line. Four
//! message types are recognized: SCHEMA, RECORD, STATE and
//! ACTIVATE_VERSION. Anything else is a hard protocol error.

use chrono::{DateTime, Utc};
use serde_json::Value;
use snafu::prelude::*;
use tracing::warn;

use crate::error::{MalformedJsonSnafu, MissingFieldSnafu, ProtocolError, UnknownMessageTypeSnafu};

/// A decoded tap message.
#[derive(Debug, Clone)]
pub enum Message {
    Schema(SchemaMessage),
    Record(RecordMessage),
    State(StateMessage),
    ActivateVersion(ActivateVersionMessage),
}

/// SCHEMA: declares or updates a stream's JSON-Schema and key set.
#[derive(Debug, Clone)]
pub struct SchemaMessage {
    pub stream: String,
    pub schema: Value,
    pub key_properties: Vec<String>,
}

/// RECORD: one data record for a previously declared stream.
#[derive(Debug, Clone)]
pub struct RecordMessage {
    pub stream: String,
    pub record: Value,
    pub time_extracted: Option<DateTime<Utc>>,
    pub version: Option<i64>,
}

/// STATE: opaque checkpoint payload to be echoed after its records are
/// durable.
#[derive(Debug, Clone)]
pub struct StateMessage {
    pub value: Value,
}

/// ACTIVATE_VERSION: per-stream table-version marker.
#[derive(Debug, Clone)]
pub struct ActivateVersionMessage {
    pub stream: String,
    pub version: i64,
}

/// Parse one input line into a [`Message`].
pub fn parse_line(line: &str, line_number: u64) -> Result<Message, ProtocolError> {
    let value: Value =
        serde_json::from_str(line).context(MalformedJsonSnafu { line_number })?;

    let message_type = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            MissingFieldSnafu {
                message_type: "message",
                field: "type",
                line_number,
            }
            .build()
        })?;

    match message_type.as_str() {
        "SCHEMA" => parse_schema(&value, line_number).map(Message::Schema),
        "RECORD" => parse_record(&value, line_number).map(Message::Record),
        "STATE" => parse_state(&value, line_number).map(Message::State),
        "ACTIVATE_VERSION" => {
            parse_activate_version(&value, line_number).map(Message::ActivateVersion)
        }
        _ => UnknownMessageTypeSnafu {
            message_type,
            line_number,
        }
        .fail(),
    }
}

fn require_str(
    value: &Value,
    message_type: &'static str,
    field: &'static str,
    line_number: u64,
) -> Result<String, ProtocolError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            MissingFieldSnafu {
                message_type,
                field,
                line_number,
            }
            .build()
        })
}

fn parse_schema(value: &Value, line_number: u64) -> Result<SchemaMessage, ProtocolError> {
    let stream = require_str(value, "SCHEMA", "stream", line_number)?;
    let schema = value
        .get("schema")
        .filter(|s| s.is_object())
        .cloned()
        .ok_or_else(|| {
            MissingFieldSnafu {
                message_type: "SCHEMA",
                field: "schema",
                line_number,
            }
            .build()
        })?;
    let key_properties = value
        .get("key_properties")
        .and_then(Value::as_array)
        .map(|keys| {
            keys.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .ok_or_else(|| {
            MissingFieldSnafu {
                message_type: "SCHEMA",
                field: "key_properties",
                line_number,
            }
            .build()
        })?;

    Ok(SchemaMessage {
        stream,
        schema,
        key_properties,
    })
}

fn parse_record(value: &Value, line_number: u64) -> Result<RecordMessage, ProtocolError> {
    let stream = require_str(value, "RECORD", "stream", line_number)?;
    let record = value
        .get("record")
        .filter(|r| r.is_object())
        .cloned()
        .ok_or_else(|| {
            MissingFieldSnafu {
                message_type: "RECORD",
                field: "record",
                line_number,
            }
            .build()
        })?;

    // `time_extracted` is advisory metadata; an unparseable value is
    // dropped rather than failing the stream.
    let time_extracted = value.get("time_extracted").and_then(Value::as_str).and_then(|raw| {
        match DateTime::parse_from_rfc3339(raw) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(_) => {
                warn!(%stream, time_extracted = raw, "Ignoring unparseable time_extracted");
                None
            }
        }
    });

    let version = value.get("version").and_then(Value::as_i64);

    Ok(RecordMessage {
        stream,
        record,
        time_extracted,
        version,
    })
}

fn parse_state(value: &Value, line_number: u64) -> Result<StateMessage, ProtocolError> {
    let state = value.get("value").cloned().ok_or_else(|| {
        MissingFieldSnafu {
            message_type: "STATE",
            field: "value",
            line_number,
        }
        .build()
    })?;
    Ok(StateMessage { value: state })
}

fn parse_activate_version(
    value: &Value,
    line_number: u64,
) -> Result<ActivateVersionMessage, ProtocolError> {
    let stream = require_str(value, "ACTIVATE_VERSION", "stream", line_number)?;
    let version = value.get("version").and_then(Value::as_i64).ok_or_else(|| {
        MissingFieldSnafu {
            message_type: "ACTIVATE_VERSION",
            field: "version",
            line_number,
        }
        .build()
    })?;
    Ok(ActivateVersionMessage { stream, version })
}
