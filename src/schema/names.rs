//! Safe warehouse identifiers.
//!
//! Raw tap names become uppercase identifiers with non-alphanumerics
//! replaced by underscores. Identifiers longer than the warehouse limit
//! are truncated with a stable hash suffix so distinct long names stay
//! distinct.

use sha2::{Digest, Sha256};

/// Maximum identifier length accepted by the warehouse.
pub const MAX_IDENTIFIER_LENGTH: usize = 127;

/// Hex chars of the hash suffix appended to truncated identifiers.
const HASH_SUFFIX_LENGTH: usize = 8;

/// Sanitize a raw column name into a safe identifier.
///
/// Idempotent: applying it to its own output is a no-op.
pub fn safe_column_name(raw: &str) -> String {
    let mut name: String = raw
        .to_uppercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    if name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        name.insert(0, '_');
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        let digest = Sha256::digest(name.as_bytes());
        let suffix: String = digest[..HASH_SUFFIX_LENGTH / 2]
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect();
        name.truncate(MAX_IDENTIFIER_LENGTH - HASH_SUFFIX_LENGTH);
        name.push_str(&suffix);
    }

    name
}

/// Sanitize the table component of a stream name.
pub fn safe_table_name(raw: &str) -> String {
    safe_column_name(raw)
}

/// Double-quote an identifier for use in SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Catalog/schema/table components of a compound stream name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParts {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub table: String,
}

/// Split a compound stream name on `separator`.
///
/// One component is a bare table, two are schema-table, three or more are
/// catalog-schema-table (the table keeps any further separators).
pub fn stream_name_to_parts(stream: &str, separator: char) -> StreamParts {
    let parts: Vec<&str> = stream.split(separator).collect();
    match parts.as_slice() {
        [table] => StreamParts {
            catalog: None,
            schema: None,
            table: (*table).to_string(),
        },
        [schema, table] => StreamParts {
            catalog: None,
            schema: Some((*schema).to_string()),
            table: (*table).to_string(),
        },
        [catalog, schema, rest @ ..] => StreamParts {
            catalog: Some((*catalog).to_string()),
            schema: Some((*schema).to_string()),
            table: rest.join(&separator.to_string()),
        },
        [] => StreamParts {
            catalog: None,
            schema: None,
            table: String::new(),
        },
    }
}
