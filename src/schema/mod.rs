//! Declared JSON-Schema handling: parsing into typed nodes, the column
//! type lattice, and nested-object flattening.
//!
//! A SCHEMA message's JSON-Schema is parsed into a [`SchemaNode`] tree,
//! then lowered into a [`FlattenedSchema`]: an ordered set of safe column
//! names with resolved warehouse types. Flattening recurses into object
//! properties up to a configured depth; everything at or beyond the bound
//! becomes a semi-structured SUPER column.

pub mod names;

use serde_json::Value;
use std::collections::HashMap;

use crate::error::{
    DuplicateColumnAfterFlatteningSnafu, SchemaDepthExceededSnafu, SchemaError,
};
use names::safe_column_name;

/// Hard cap on schema nesting. A parsed JSON document is a finite tree,
/// so this bound stands in for cyclic-schema detection.
const MAX_SCHEMA_DEPTH: u32 = 64;

/// Widest VARCHAR the warehouse accepts.
pub const MAX_VARCHAR_LENGTH: u32 = 65_535;

/// VARCHAR length used for `format: time` strings.
const TIME_VARCHAR_LENGTH: u32 = 16;

/// Separator joining parent and child keys of flattened columns.
pub const FLATTEN_SEPARATOR: &str = "__";

/// Scalar JSON-Schema types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    String,
    Integer,
    Number,
    Boolean,
}

/// Recognized `format` annotations on string schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringFormat {
    DateTime,
    Date,
    Time,
}

/// A typed JSON-Schema node.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaNode {
    Scalar {
        kind: ScalarKind,
        format: Option<StringFormat>,
        max_length: Option<u32>,
        nullable: bool,
    },
    /// Object with declared properties (empty means opaque).
    Object {
        properties: Vec<(String, SchemaNode)>,
        nullable: bool,
    },
    /// Arrays are never recursed into.
    Array { nullable: bool },
    /// Unknown or untyped schema.
    Any { nullable: bool },
}

impl SchemaNode {
    /// Parse a JSON-Schema value into a typed node.
    pub fn parse(stream: &str, value: &Value) -> Result<Self, SchemaError> {
        parse_node(stream, value, 0)
    }
}

fn parse_node(stream: &str, value: &Value, depth: u32) -> Result<SchemaNode, SchemaError> {
    if depth > MAX_SCHEMA_DEPTH {
        return SchemaDepthExceededSnafu { stream }.fail();
    }

    // anyOf/oneOf collapse to the first non-null branch, which becomes
    // nullable.
    for combinator in ["anyOf", "oneOf"] {
        if let Some(branches) = value.get(combinator).and_then(Value::as_array) {
            let branch = branches
                .iter()
                .find(|b| b.get("type").and_then(Value::as_str) != Some("null"));
            return match branch {
                Some(branch) => {
                    let node = parse_node(stream, branch, depth + 1)?;
                    Ok(node.into_nullable())
                }
                None => Ok(SchemaNode::Any { nullable: true }),
            };
        }
    }

    let types: Vec<&str> = match value.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(ts)) => ts.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };

    let nullable = types.contains(&"null");
    let non_null: Vec<&str> = types.into_iter().filter(|t| *t != "null").collect();

    let node = match non_null.as_slice() {
        [] => SchemaNode::Any { nullable },
        ["string"] => SchemaNode::Scalar {
            kind: ScalarKind::String,
            format: parse_format(value),
            max_length: value
                .get("maxLength")
                .and_then(Value::as_u64)
                .map(|n| n.min(u64::from(MAX_VARCHAR_LENGTH)) as u32),
            nullable,
        },
        ["integer"] => scalar(ScalarKind::Integer, nullable),
        ["number"] => scalar(ScalarKind::Number, nullable),
        ["boolean"] => scalar(ScalarKind::Boolean, nullable),
        ["object"] => {
            let mut properties = Vec::new();
            if let Some(props) = value.get("properties").and_then(Value::as_object) {
                for (key, prop) in props {
                    properties.push((key.clone(), parse_node(stream, prop, depth + 1)?));
                }
            }
            SchemaNode::Object {
                properties,
                nullable,
            }
        }
        ["array"] => SchemaNode::Array { nullable },
        types if types.iter().any(|t| *t == "object" || *t == "array") => {
            // Mixed unions involving containers load as semi-structured.
            SchemaNode::Array { nullable }
        }
        [_single] => SchemaNode::Any { nullable },
        _ => SchemaNode::Scalar {
            // Mixed scalar unions fall back to the widest VARCHAR.
            kind: ScalarKind::String,
            format: None,
            max_length: Some(MAX_VARCHAR_LENGTH),
            nullable,
        },
    };

    Ok(node)
}

fn scalar(kind: ScalarKind, nullable: bool) -> SchemaNode {
    SchemaNode::Scalar {
        kind,
        format: None,
        max_length: None,
        nullable,
    }
}

fn parse_format(value: &Value) -> Option<StringFormat> {
    match value.get("format").and_then(Value::as_str) {
        Some("date-time") => Some(StringFormat::DateTime),
        Some("date") => Some(StringFormat::Date),
        Some("time") => Some(StringFormat::Time),
        _ => None,
    }
}

impl SchemaNode {
    fn into_nullable(self) -> Self {
        match self {
            SchemaNode::Scalar {
                kind,
                format,
                max_length,
                ..
            } => SchemaNode::Scalar {
                kind,
                format,
                max_length,
                nullable: true,
            },
            SchemaNode::Object { properties, .. } => SchemaNode::Object {
                properties,
                nullable: true,
            },
            SchemaNode::Array { .. } => SchemaNode::Array { nullable: true },
            SchemaNode::Any { .. } => SchemaNode::Any { nullable: true },
        }
    }
}

/// Resolved warehouse column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Timestamp,
    Date,
    Varchar(u32),
    Numeric,
    Float,
    Boolean,
    BigInt,
    Super,
}

impl ColumnType {
    /// SQL type expression for DDL.
    pub fn sql(self) -> String {
        match self {
            ColumnType::Timestamp => "timestamp without time zone".to_string(),
            ColumnType::Date => "date".to_string(),
            ColumnType::Varchar(n) => format!("character varying({n})"),
            ColumnType::Numeric => "numeric(38,0)".to_string(),
            ColumnType::Float => "float".to_string(),
            ColumnType::Boolean => "boolean".to_string(),
            ColumnType::BigInt => "bigint".to_string(),
            ColumnType::Super => "super".to_string(),
        }
    }

    /// The declared length when this is a VARCHAR column.
    pub fn varchar_length(self) -> Option<u32> {
        match self {
            ColumnType::Varchar(n) => Some(n),
            _ => None,
        }
    }
}

/// Map a flattened leaf node to its warehouse type.
///
/// Never fails: unknown shapes fall through to the default VARCHAR.
pub fn column_type(node: &SchemaNode, default_varchar: u32) -> ColumnType {
    match node {
        SchemaNode::Scalar { kind, format, max_length, .. } => match kind {
            ScalarKind::String => match format {
                Some(StringFormat::DateTime) => ColumnType::Timestamp,
                Some(StringFormat::Date) => ColumnType::Date,
                Some(StringFormat::Time) => ColumnType::Varchar(TIME_VARCHAR_LENGTH),
                None => match max_length {
                    // Multi-byte headroom, capped at the warehouse limit.
                    Some(n) => ColumnType::Varchar(n.saturating_mul(3).min(MAX_VARCHAR_LENGTH)),
                    None => ColumnType::Varchar(default_varchar),
                },
            },
            ScalarKind::Integer => ColumnType::Numeric,
            ScalarKind::Number => ColumnType::Float,
            ScalarKind::Boolean => ColumnType::Boolean,
        },
        SchemaNode::Object { .. } | SchemaNode::Array { .. } => ColumnType::Super,
        SchemaNode::Any { .. } => ColumnType::Varchar(default_varchar),
    }
}

/// Metadata columns prepended to every stream when enabled.
pub const METADATA_COLUMNS: &[(&str, ColumnType)] = &[
    ("_SDC_EXTRACTED_AT", ColumnType::Timestamp),
    ("_SDC_RECEIVED_AT", ColumnType::Timestamp),
    ("_SDC_BATCHED_AT", ColumnType::Timestamp),
    ("_SDC_DELETED_AT", ColumnType::Timestamp),
    ("_SDC_SEQUENCE", ColumnType::BigInt),
    ("_SDC_TABLE_VERSION", ColumnType::BigInt),
];

/// One flattened column: safe name, source path into the record, and
/// resolved type.
#[derive(Debug, Clone, PartialEq)]
pub struct FlattenedColumn {
    pub name: String,
    pub path: Vec<String>,
    pub column_type: ColumnType,
}

/// Ordered flat column set produced from a declared schema.
#[derive(Debug, Clone, PartialEq)]
pub struct FlattenedSchema {
    columns: Vec<FlattenedColumn>,
    with_metadata: bool,
}

impl FlattenedSchema {
    /// Flatten a declared JSON-Schema down to `max_level` object depth.
    pub fn from_declared(
        stream: &str,
        schema: &Value,
        max_level: u32,
        default_varchar: u32,
        with_metadata: bool,
    ) -> Result<Self, SchemaError> {
        let root = SchemaNode::parse(stream, schema)?;
        let mut columns = Vec::new();

        if let SchemaNode::Object { properties, .. } = root {
            let mut seen: HashMap<String, String> = HashMap::new();
            flatten_into(
                stream,
                &properties,
                &mut Vec::new(),
                0,
                max_level,
                default_varchar,
                &mut seen,
                &mut columns,
            )?;
        }

        // Taps may declare `_sdc_*` fields themselves; the prepended
        // metadata columns already cover those.
        if with_metadata {
            columns.retain(|column| {
                !METADATA_COLUMNS
                    .iter()
                    .any(|(name, _)| *name == column.name)
            });
        }

        Ok(Self {
            columns,
            with_metadata,
        })
    }

    /// Data columns, in declaration order (metadata columns excluded).
    pub fn columns(&self) -> &[FlattenedColumn] {
        &self.columns
    }

    pub fn with_metadata(&self) -> bool {
        self.with_metadata
    }

    /// All column names with types, metadata first, in load order.
    pub fn ordered_columns(&self) -> Vec<(&str, ColumnType)> {
        let metadata = if self.with_metadata {
            METADATA_COLUMNS
        } else {
            &[]
        };
        metadata
            .iter()
            .map(|(name, ty)| (*name, *ty))
            .chain(self.columns.iter().map(|c| (c.name.as_str(), c.column_type)))
            .collect()
    }

    /// Whether a safe column name exists in this schema.
    pub fn contains(&self, safe_name: &str) -> bool {
        self.ordered_columns().iter().any(|(name, _)| *name == safe_name)
    }
}

#[allow(clippy::too_many_arguments)]
fn flatten_into(
    stream: &str,
    properties: &[(String, SchemaNode)],
    path: &mut Vec<String>,
    level: u32,
    max_level: u32,
    default_varchar: u32,
    seen: &mut HashMap<String, String>,
    columns: &mut Vec<FlattenedColumn>,
) -> Result<(), SchemaError> {
    for (key, node) in properties {
        path.push(key.clone());

        let descend = matches!(
            node,
            SchemaNode::Object { properties, .. } if !properties.is_empty()
        ) && level < max_level;

        if descend {
            let SchemaNode::Object { properties, .. } = node else {
                unreachable!("descend implies an object node");
            };
            flatten_into(
                stream,
                properties,
                path,
                level + 1,
                max_level,
                default_varchar,
                seen,
                columns,
            )?;
        } else {
            let raw = path.join(FLATTEN_SEPARATOR);
            let name = safe_column_name(&raw);
            if let Some(previous) = seen.insert(name.clone(), raw.clone()) {
                if previous != raw {
                    return DuplicateColumnAfterFlatteningSnafu {
                        stream,
                        column: name,
                    }
                    .fail();
                }
                // Identical source path declared twice collapses silently.
                path.pop();
                continue;
            }
            columns.push(FlattenedColumn {
                name,
                path: path.clone(),
                column_type: column_type(node, default_varchar),
            });
        }

        path.pop();
    }
    Ok(())
}
