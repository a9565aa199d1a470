//! Error types for target-redshift using snafu.
//!
//! This module defines structured error types with context selectors for
//! all error conditions in the codebase.

use snafu::prelude::*;

// ============ Protocol Errors ============

/// Errors raised while decoding the tap message stream.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProtocolError {
    /// Input line is not valid JSON.
    #[snafu(display("Malformed JSON on input line {line_number}"))]
    MalformedJson {
        line_number: u64,
        source: serde_json::Error,
    },

    /// Message carries an unrecognized `type` value.
    #[snafu(display("Unknown message type '{message_type}' on input line {line_number}"))]
    UnknownMessageType {
        message_type: String,
        line_number: u64,
    },

    /// Message is missing a required field.
    #[snafu(display("{message_type} message on line {line_number} is missing '{field}'"))]
    MissingField {
        message_type: &'static str,
        field: &'static str,
        line_number: u64,
    },

    /// A RECORD or ACTIVATE_VERSION arrived for a stream with no SCHEMA yet.
    #[snafu(display("{message_type} for stream '{stream}' received before its SCHEMA"))]
    MessageBeforeSchema {
        message_type: &'static str,
        stream: String,
    },
}

// ============ Schema Errors ============

/// Errors raised while flattening or mapping a declared JSON-Schema.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SchemaError {
    /// Two source paths collapsed to the same safe column name.
    #[snafu(display(
        "Duplicate column name '{column}' after flattening schema of stream '{stream}'"
    ))]
    DuplicateColumnAfterFlattening { stream: String, column: String },

    /// Schema nesting exceeded the supported depth.
    #[snafu(display("Schema of stream '{stream}' exceeds the maximum nesting depth"))]
    SchemaDepthExceeded { stream: String },

    /// Stream declared no key properties while `primary_key_required` is set.
    #[snafu(display(
        "Stream '{stream}' has no key properties and 'primary_key_required' is enabled"
    ))]
    PrimaryKeyRequired { stream: String },

    /// A declared key property is absent from the flattened column set.
    #[snafu(display("Key property '{property}' of stream '{stream}' is not in the schema"))]
    PrimaryKeyNotFound { stream: String, property: String },

    /// No target schema could be resolved for the stream.
    #[snafu(display(
        "Unable to resolve a target schema for stream '{stream}': set \
         'default_target_schema' or add a 'schema_mapping' entry"
    ))]
    NoTargetSchema { stream: String },
}

// ============ Record Errors ============

/// Per-record validation errors, raised only when `validate_records` is set.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RecordError {
    /// Value in a date-time column is not a parseable timestamp.
    #[snafu(display(
        "Invalid date-time value '{value}' in column '{column}' of stream '{stream}'"
    ))]
    InvalidDateTime {
        stream: String,
        column: String,
        value: String,
    },

    /// The record payload is not a JSON object.
    #[snafu(display("Record in stream '{stream}' is not a JSON object"))]
    RecordNotAnObject { stream: String },
}

// ============ Storage Errors ============

/// Errors from the stage directory or the object store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Failed to create or write a stage file.
    #[snafu(display("Stage file error for {path}"))]
    StageFile {
        path: String,
        source: std::io::Error,
    },

    /// Failed to encode a CSV row into the stage file.
    #[snafu(display("CSV encoding error for {path}"))]
    CsvEncode { path: String, source: csv::Error },

    /// Object store operation failed.
    #[snafu(display("Object store operation failed for key '{key}'"))]
    ObjectStore {
        key: String,
        source: object_store::Error,
    },

    /// S3 client configuration error.
    #[snafu(display("S3 configuration error"))]
    S3Config { source: object_store::Error },

    /// Invalid S3 ACL value.
    #[snafu(display("Invalid s3_acl value '{acl}'"))]
    InvalidAcl { acl: String },
}

// ============ Sync Errors ============

/// Errors from the warehouse sync layer (DDL, COPY, merge).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SyncError {
    /// Failed to open the warehouse connection pool.
    #[snafu(display("Failed to connect to the warehouse"))]
    Connect { source: sqlx::Error },

    /// A SQL statement failed.
    #[snafu(display("SQL statement failed: {statement}"))]
    Sql {
        statement: String,
        source: sqlx::Error,
    },

    /// Catalog introspection failed.
    #[snafu(display("Failed to list columns of schema '{schema}'"))]
    Catalog { schema: String, source: sqlx::Error },

    /// Staging upload or delete failed.
    #[snafu(display("Staging operation failed for stream '{stream}'"))]
    Staging {
        stream: String,
        source: StorageError,
    },

    /// No usable COPY credentials were found.
    #[snafu(display(
        "No COPY credentials: set 'aws_redshift_copy_role_arn' or AWS access keys"
    ))]
    MissingCopyCredentials,

    /// Generic load failure (used by warehouse implementations without a
    /// richer source error, e.g. test doubles).
    #[snafu(display("Warehouse operation failed: {message}"))]
    Failed { message: String },
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[snafu(display("Failed to read configuration file"))]
    ReadFile { source: std::io::Error },

    /// Failed to parse the JSON configuration.
    #[snafu(display("Failed to parse JSON configuration"))]
    JsonParse { source: serde_json::Error },

    /// A required configuration key is missing or empty.
    #[snafu(display("Required configuration key '{key}' is missing or empty"))]
    MissingKey { key: &'static str },

    /// A configuration value is out of range.
    #[snafu(display("Invalid value for configuration key '{key}': {message}"))]
    InvalidValue { key: &'static str, message: String },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Failed to parse the metrics listen address.
    #[snafu(display("Failed to parse metrics address"))]
    AddressParse { source: std::net::AddrParseError },
}

// ============ Target Error (top-level) ============

/// Top-level errors that aggregate all error domains.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TargetError {
    /// Protocol error.
    #[snafu(display("Protocol error"))]
    Protocol { source: ProtocolError },

    /// Schema error.
    #[snafu(display("Schema error"))]
    Schema { source: SchemaError },

    /// Record validation error.
    #[snafu(display("Record validation error"))]
    Record { source: RecordError },

    /// Storage error.
    #[snafu(display("Storage error"))]
    TargetStorage { source: StorageError },

    /// Warehouse sync error.
    #[snafu(display("Warehouse sync error"))]
    Sync { source: SyncError },

    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Metrics error.
    #[snafu(display("Metrics error"))]
    Metrics { source: MetricsError },

    /// Failed to read from the input stream.
    #[snafu(display("Failed to read input"))]
    ReadInput { source: std::io::Error },

    /// Failed to write a STATE message to the output stream.
    #[snafu(display("Failed to emit state"))]
    EmitState { source: std::io::Error },

    /// A flush worker panicked or was aborted.
    #[snafu(display("Flush task failed"))]
    TaskJoin { source: tokio::task::JoinError },

    /// The target was interrupted by a signal.
    #[snafu(display("Interrupted by signal"))]
    Interrupted,
}

impl TargetError {
    /// True when the error is the signal-driven shutdown path.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, TargetError::Interrupted)
    }
}
