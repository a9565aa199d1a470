//! Configuration parsing and validation.
//!
//! The target reads a single JSON configuration document (Singer
//! convention) describing the warehouse connection, the S3 staging
//! area, and the batching/loading policy.

use serde::{Deserialize, Deserializer, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, InvalidValueSnafu, JsonParseSnafu, MissingKeySnafu, ReadFileSnafu};

/// Default VARCHAR length for strings without a declared `maxLength`.
pub const DEFAULT_VARCHAR_LENGTH: u32 = 10_000;

/// Main configuration structure for the target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Warehouse connection.
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,

    // AWS credentials for staging and COPY.
    #[serde(default)]
    pub aws_profile: Option<String>,
    #[serde(default)]
    pub aws_access_key_id: Option<String>,
    #[serde(default)]
    pub aws_secret_access_key: Option<String>,
    #[serde(default)]
    pub aws_session_token: Option<String>,
    /// When set, COPY authenticates with this role ARN instead of keys.
    #[serde(default)]
    pub aws_redshift_copy_role_arn: Option<String>,

    // Staging location.
    pub s3_bucket: String,
    #[serde(default)]
    pub s3_key_prefix: String,
    #[serde(default)]
    pub s3_acl: Option<String>,

    // Target schema resolution and grants.
    #[serde(default)]
    pub default_target_schema: Option<String>,
    #[serde(default)]
    pub default_target_schema_select_permissions: Option<GrantPrincipals>,
    #[serde(default)]
    pub schema_mapping: HashMap<String, SchemaMapping>,

    // Batching policy.
    #[serde(default = "default_batch_size_rows")]
    pub batch_size_rows: usize,
    #[serde(default)]
    pub flush_all_streams: bool,

    // Flush worker pool sizing. `parallelism` of 0 sizes the pool to the
    // number of active streams, -1 to the CPU count.
    #[serde(default)]
    pub parallelism: i32,
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,

    // Staging layout.
    #[serde(default)]
    pub compression: Compression,
    #[serde(default = "default_slices")]
    pub slices: usize,

    /// Options appended verbatim to the fixed COPY clause.
    #[serde(default = "default_copy_options")]
    pub copy_options: String,

    // Metadata and delete semantics.
    #[serde(default)]
    pub add_metadata_columns: bool,
    #[serde(default)]
    pub hard_delete: bool,

    // Record handling policy.
    #[serde(default)]
    pub data_flattening_max_level: u32,
    #[serde(default = "default_true")]
    pub primary_key_required: bool,
    #[serde(default)]
    pub validate_records: bool,
    #[serde(default)]
    pub skip_updates: bool,

    /// Override for the default VARCHAR length of unbounded strings.
    #[serde(default)]
    pub varchar_length: Option<u32>,

    #[serde(default)]
    pub disable_table_cache: bool,

    /// Scratch directory for stage files (OS default when unset).
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

/// Per-source-schema override of the target schema and its grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaMapping {
    pub target_schema: String,
    #[serde(default)]
    pub target_schema_select_permissions: Option<GrantPrincipals>,
}

/// Principals receiving USAGE/SELECT grants. Accepts a single name, a
/// list of names (both treated as users), or explicit user/group lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GrantPrincipals {
    One(String),
    Many(Vec<String>),
    Split {
        #[serde(default)]
        users: Vec<String>,
        #[serde(default)]
        groups: Vec<String>,
    },
}

impl GrantPrincipals {
    /// Normalize to (users, groups).
    pub fn resolve(&self) -> (Vec<String>, Vec<String>) {
        match self {
            GrantPrincipals::One(name) => (vec![name.clone()], Vec::new()),
            GrantPrincipals::Many(names) => (names.clone(), Vec::new()),
            GrantPrincipals::Split { users, groups } => (users.clone(), groups.clone()),
        }
    }
}

/// Compression applied to stage files and declared in the COPY clause.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Bzip2,
}

impl Compression {
    /// Stage file extension for this compression.
    pub fn extension(self) -> &'static str {
        match self {
            Compression::None => "csv",
            Compression::Gzip => "csv.gz",
            Compression::Bzip2 => "csv.bz2",
        }
    }

    /// Keyword added to the fixed COPY clause, if any.
    pub fn copy_keyword(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Gzip => Some("GZIP"),
            Compression::Bzip2 => Some("BZIP2"),
        }
    }
}

// The config convention uses an empty string for "no compression".
impl<'de> Deserialize<'de> for Compression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "bzip2" => Ok(Compression::Bzip2),
            other => Err(serde::de::Error::custom(format!(
                "unknown compression '{other}' (expected gzip or bzip2)"
            ))),
        }
    }
}

fn default_port() -> u16 {
    5439
}

fn default_batch_size_rows() -> usize {
    100_000
}

fn default_max_parallelism() -> usize {
    16
}

fn default_slices() -> usize {
    1
}

fn default_copy_options() -> String {
    "EMPTYASNULL BLANKSASNULL TRIMBLANKS TRUNCATECOLUMNS \
     TIMEFORMAT 'auto' COMPUPDATE OFF STATUPDATE OFF"
        .to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        let config: Config = serde_json::from_str(&content).context(JsonParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.host.is_empty(), MissingKeySnafu { key: "host" });
        ensure!(!self.user.is_empty(), MissingKeySnafu { key: "user" });
        ensure!(!self.password.is_empty(), MissingKeySnafu { key: "password" });
        ensure!(!self.dbname.is_empty(), MissingKeySnafu { key: "dbname" });
        ensure!(!self.s3_bucket.is_empty(), MissingKeySnafu { key: "s3_bucket" });
        ensure!(
            self.default_target_schema.is_some() || !self.schema_mapping.is_empty(),
            MissingKeySnafu {
                key: "default_target_schema",
            }
        );
        ensure!(
            self.batch_size_rows > 0,
            InvalidValueSnafu {
                key: "batch_size_rows",
                message: "must be positive".to_string(),
            }
        );
        ensure!(
            self.slices > 0,
            InvalidValueSnafu {
                key: "slices",
                message: "must be at least 1".to_string(),
            }
        );
        ensure!(
            self.max_parallelism > 0,
            InvalidValueSnafu {
                key: "max_parallelism",
                message: "must be at least 1".to_string(),
            }
        );
        Ok(())
    }

    /// Whether metadata columns are injected. `hard_delete` depends on the
    /// `_SDC_DELETED_AT` column and therefore implies them.
    pub fn metadata_columns_enabled(&self) -> bool {
        self.add_metadata_columns || self.hard_delete
    }

    /// Resolve the target schema for a stream's source schema component.
    pub fn target_schema(&self, source_schema: Option<&str>) -> Option<String> {
        if let Some(source) = source_schema {
            if let Some(mapping) = self.schema_mapping.get(source) {
                return Some(mapping.target_schema.clone());
            }
        }
        self.default_target_schema.clone()
    }

    /// Grants to apply for the given source schema, if configured.
    pub fn grants_for(&self, source_schema: Option<&str>) -> Option<&GrantPrincipals> {
        if let Some(source) = source_schema {
            if let Some(mapping) = self.schema_mapping.get(source) {
                return mapping.target_schema_select_permissions.as_ref();
            }
        }
        self.default_target_schema_select_permissions.as_ref()
    }

    /// All distinct target schemas referenced by this configuration.
    pub fn target_schemas(&self) -> Vec<String> {
        let mut schemas: Vec<String> = self
            .default_target_schema
            .iter()
            .cloned()
            .chain(self.schema_mapping.values().map(|m| m.target_schema.clone()))
            .collect();
        schemas.sort();
        schemas.dedup();
        schemas
    }

    /// Scratch directory root for stage files.
    pub fn scratch_root(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Default VARCHAR length, honoring the `varchar_length` override.
    pub fn default_varchar_length(&self) -> u32 {
        self.varchar_length.unwrap_or(DEFAULT_VARCHAR_LENGTH)
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    serde_json::from_value(serde_json::json!({
        "host": "localhost",
        "user": "dummy",
        "password": "dummy",
        "dbname": "dummy",
        "s3_bucket": "test-bucket",
        "default_target_schema": "analytics"
    }))
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_is_valid() {
        let config = test_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 5439);
        assert_eq!(config.batch_size_rows, 100_000);
        assert_eq!(config.max_parallelism, 16);
        assert_eq!(config.slices, 1);
        assert!(config.primary_key_required);
        assert!(!config.flush_all_streams);
        assert_eq!(config.compression, Compression::None);
        assert!(config.copy_options.contains("EMPTYASNULL"));
    }

    #[test]
    fn missing_connection_keys_fail_validation() {
        let mut config = test_config();
        config.host = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingKey { key: "host" })
        ));
    }

    #[test]
    fn schema_mapping_satisfies_schema_requirement() {
        let mut config = test_config();
        config.default_target_schema = None;
        assert!(config.validate().is_err());

        config.schema_mapping.insert(
            "source_db".to_string(),
            SchemaMapping {
                target_schema: "mapped".to_string(),
                target_schema_select_permissions: None,
            },
        );
        assert!(config.validate().is_ok());
        assert_eq!(
            config.target_schema(Some("source_db")).as_deref(),
            Some("mapped")
        );
        assert_eq!(config.target_schema(Some("other")), None);
    }

    #[test]
    fn compression_accepts_empty_string() {
        let mut config = test_config();
        for (raw, expected) in [
            ("", Compression::None),
            ("gzip", Compression::Gzip),
            ("bzip2", Compression::Bzip2),
        ] {
            config.compression = serde_json::from_value(serde_json::json!(raw)).unwrap();
            assert_eq!(config.compression, expected);
        }
        assert!(serde_json::from_value::<Compression>(serde_json::json!("zstd")).is_err());
    }

    #[test]
    fn grant_principals_shapes() {
        let one: GrantPrincipals = serde_json::from_value(serde_json::json!("alice")).unwrap();
        assert_eq!(one.resolve(), (vec!["alice".to_string()], vec![]));

        let many: GrantPrincipals =
            serde_json::from_value(serde_json::json!(["alice", "bob"])).unwrap();
        assert_eq!(many.resolve().0.len(), 2);

        let split: GrantPrincipals = serde_json::from_value(serde_json::json!({
            "users": ["alice"],
            "groups": ["readers"]
        }))
        .unwrap();
        let (users, groups) = split.resolve();
        assert_eq!(users, vec!["alice".to_string()]);
        assert_eq!(groups, vec!["readers".to_string()]);
    }

    #[test]
    fn hard_delete_implies_metadata_columns() {
        let mut config = test_config();
        assert!(!config.metadata_columns_enabled());
        config.hard_delete = true;
        assert!(config.metadata_columns_enabled());
    }

    #[test]
    fn target_schemas_are_deduplicated() {
        let mut config = test_config();
        config.schema_mapping.insert(
            "a".to_string(),
            SchemaMapping {
                target_schema: "analytics".to_string(),
                target_schema_select_permissions: None,
            },
        );
        config.schema_mapping.insert(
            "b".to_string(),
            SchemaMapping {
                target_schema: "raw".to_string(),
                target_schema_select_permissions: None,
            },
        );
        assert_eq!(config.target_schemas(), vec!["analytics", "raw"]);
    }
}
