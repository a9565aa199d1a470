//! Warehouse sync: DDL, staging upload, COPY, merge, grants.
//!
//! One [`DbSync`] is shared by all flush workers. Each load is
//! all-or-nothing: the staged CSV is COPYed into a transient table and
//! merged into the target in a single transaction; on failure the
//! transient table is dropped and the target is untouched.

pub mod client;

use snafu::prelude::*;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, GrantPrincipals};
use crate::emit;
use crate::error::{MissingCopyCredentialsSnafu, StagingSnafu, SyncError};
use crate::metrics::events::BatchLoaded;
use crate::registry::StreamSpec;
use crate::schema::ColumnType;
use crate::schema::names::quote_ident;
use crate::stage::StagedBatch;
use crate::storage::StageStore;

use client::{CatalogColumn, Warehouse};

const RETRY_MAX_ATTEMPTS: u32 = 3;
const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(500);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

/// Credentials clause of the COPY statement.
enum CopyCredentials {
    Role(String),
    Keys {
        access_key_id: String,
        secret_access_key: String,
        session_token: Option<String>,
    },
}

impl CopyCredentials {
    /// Resolve from config keys, then the standard AWS environment.
    fn resolve(config: &Config) -> Result<Self, SyncError> {
        if let Some(arn) = &config.aws_redshift_copy_role_arn {
            return Ok(CopyCredentials::Role(arn.clone()));
        }

        let access_key_id = config
            .aws_access_key_id
            .clone()
            .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok());
        let secret_access_key = config
            .aws_secret_access_key
            .clone()
            .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok());
        let session_token = config
            .aws_session_token
            .clone()
            .or_else(|| std::env::var("AWS_SESSION_TOKEN").ok());

        match (access_key_id, secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => Ok(CopyCredentials::Keys {
                access_key_id,
                secret_access_key,
                session_token,
            }),
            _ => MissingCopyCredentialsSnafu.fail(),
        }
    }

    fn sql_clause(&self) -> String {
        match self {
            CopyCredentials::Role(arn) => format!("IAM_ROLE '{arn}'"),
            CopyCredentials::Keys {
                access_key_id,
                secret_access_key,
                session_token,
            } => {
                let mut creds =
                    format!("aws_access_key_id={access_key_id};aws_secret_access_key={secret_access_key}");
                if let Some(token) = session_token {
                    creds.push_str(&format!(";token={token}"));
                }
                format!("CREDENTIALS '{creds}'")
            }
        }
    }
}

/// Cached catalog entry: column name (uppercased) to its definition.
type TableColumns = HashMap<String, CatalogColumn>;

/// Warehouse synchronization layer shared by flush workers.
pub struct DbSync {
    config: Arc<Config>,
    warehouse: Arc<dyn Warehouse>,
    stage: StageStore,
    credentials: CopyCredentials,
    /// schema -> table -> columns. Populated at startup unless the table
    /// cache is disabled.
    catalog: Mutex<HashMap<String, HashMap<String, TableColumns>>>,
}

impl DbSync {
    pub fn new(
        config: Arc<Config>,
        warehouse: Arc<dyn Warehouse>,
        stage: StageStore,
    ) -> Result<Self, SyncError> {
        let credentials = CopyCredentials::resolve(&config)?;
        Ok(Self {
            config,
            warehouse,
            stage,
            credentials,
            catalog: Mutex::new(HashMap::new()),
        })
    }

    /// Startup pass: create every referenced target schema, apply schema
    /// grants, and warm the catalog cache.
    pub async fn prepare(&self) -> Result<(), SyncError> {
        for schema in self.config.target_schemas() {
            let statement = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&schema));
            self.warehouse.execute(&statement).await?;
        }

        for (schema, principals) in self.schema_grant_pairs() {
            let statements = schema_grant_statements(&schema, &principals);
            self.apply_grants(&statements).await;
        }

        if !self.config.disable_table_cache {
            let mut catalog = self.catalog.lock().await;
            for schema in self.config.target_schemas() {
                let columns = self.warehouse.list_columns(&schema).await?;
                let entry = catalog.entry(schema.clone()).or_default();
                for column in columns {
                    entry
                        .entry(column.table_name.to_uppercase())
                        .or_default()
                        .insert(column.column_name.to_uppercase(), column);
                }
                info!(schema = %schema, tables = entry.len(), "Cached warehouse catalog");
            }
        }

        Ok(())
    }

    /// Create the target table or apply additive/widening DDL so it
    /// matches the stream's flattened schema.
    pub async fn ensure_table(&self, spec: &StreamSpec) -> Result<(), SyncError> {
        let existing = self.table_columns(&spec.target_schema, &spec.table_name).await?;

        match existing {
            None => self.create_table(spec).await,
            Some(existing) => self.evolve_table(spec, &existing).await,
        }
    }

    /// Load one sealed batch: upload to the object store, COPY into a
    /// transient table, merge, and clean up. Returns the rows loaded.
    pub async fn load_batch(
        &self,
        spec: &StreamSpec,
        batch: &StagedBatch,
        version: Option<i64>,
    ) -> Result<u64, SyncError> {
        let started = Instant::now();
        self.ensure_table(spec).await?;

        let (keys, copy_source) = self.stage_keys(spec, batch);

        for (file, key) in batch.files.iter().zip(&keys) {
            with_retries("staging upload", || async {
                self.stage
                    .upload(file, key)
                    .await
                    .context(StagingSnafu { stream: &spec.stream })
            })
            .await?;
        }
        debug!(
            stream = %spec.stream,
            rows = batch.rows,
            files = keys.len(),
            "Staged batch {}",
            batch.batch_id
        );

        let temp_table = format!(
            "{}_TEMP_{}",
            spec.table_name,
            &batch.batch_id.simple().to_string()[..8].to_uppercase()
        );
        let qualified_temp = qualified(&spec.target_schema, &temp_table);

        let create_temp = format!(
            "CREATE TABLE {qualified_temp} ({})",
            column_definitions(spec)
        );
        self.warehouse.execute(&create_temp).await?;

        let copy = self.copy_statement(spec, &qualified_temp, &copy_source);
        let copy_result = with_retries("COPY", || async {
            self.warehouse.execute(&copy).await
        })
        .await;

        let merge_result = match copy_result {
            Ok(_) => {
                let statements = self.merge_statements(spec, &qualified_temp, version);
                self.warehouse.execute_transaction(&statements).await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = merge_result {
            // Leave the target untouched; the transient table must not
            // survive the failed load.
            let drop_temp = format!("DROP TABLE IF EXISTS {qualified_temp}");
            if let Err(drop_err) = self.warehouse.execute(&drop_temp).await {
                warn!(
                    stream = %spec.stream,
                    "Failed to drop transient table {}: {}", qualified_temp, drop_err
                );
            }
            return Err(e);
        }

        for key in &keys {
            if let Err(e) = self.stage.delete(key).await {
                warn!(stream = %spec.stream, %key, "Failed to delete staged object: {}", e);
            }
        }

        emit!(BatchLoaded {
            rows: batch.rows as u64,
            duration: started.elapsed(),
        });
        info!(
            stream = %spec.stream,
            rows = batch.rows,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Loaded batch into {}",
            qualified(&spec.target_schema, &spec.table_name)
        );

        Ok(batch.rows as u64)
    }

    /// Object keys for the batch's slice files plus the COPY source URI.
    fn stage_keys(&self, spec: &StreamSpec, batch: &StagedBatch) -> (Vec<String>, String) {
        let prefix = self.config.s3_key_prefix.trim_matches('/');
        let base = if prefix.is_empty() {
            spec.stream.clone()
        } else {
            format!("{prefix}/{}", spec.stream)
        };

        if batch.files.len() == 1 {
            let key = format!("{base}/{}.{}", batch.batch_id, batch.extension);
            let uri = self.stage.uri(&key);
            (vec![key], uri)
        } else {
            let dir = format!("{base}/{}", batch.batch_id);
            let keys = (0..batch.files.len())
                .map(|slice| format!("{dir}/part_{slice:05}.{}", batch.extension))
                .collect();
            // A prefix URI makes COPY load every slice in parallel.
            let uri = self.stage.uri(&format!("{dir}/"));
            (keys, uri)
        }
    }

    fn copy_statement(&self, spec: &StreamSpec, qualified_temp: &str, source: &str) -> String {
        let mut clause = String::from("CSV");
        if let Some(keyword) = self.config.compression.copy_keyword() {
            clause.push(' ');
            clause.push_str(keyword);
        }
        clause.push_str(" DELIMITER ',' REMOVEQUOTES ESCAPE");

        let options = self.config.copy_options.trim();
        let mut statement = format!(
            "COPY {qualified_temp} ({}) FROM '{source}' {} {clause}",
            column_list(spec),
            self.credentials.sql_clause(),
        );
        if !options.is_empty() {
            statement.push(' ');
            statement.push_str(options);
        }
        statement
    }

    /// Merge + cleanup statements, executed as one transaction.
    fn merge_statements(
        &self,
        spec: &StreamSpec,
        qualified_temp: &str,
        version: Option<i64>,
    ) -> Vec<String> {
        let target = qualified(&spec.target_schema, &spec.table_name);
        let columns = column_list(spec);
        let mut statements = Vec::new();

        if spec.key_columns.is_empty() {
            statements.push(format!(
                "INSERT INTO {target} ({columns}) SELECT {columns} FROM {qualified_temp}"
            ));
        } else if self.config.skip_updates {
            let correlate = key_predicate(&target, qualified_temp, &spec.key_columns);
            statements.push(format!(
                "INSERT INTO {target} ({columns}) SELECT {columns} FROM {qualified_temp} \
                 WHERE NOT EXISTS (SELECT 1 FROM {target} WHERE {correlate})"
            ));
        } else {
            let correlate = key_predicate(&target, qualified_temp, &spec.key_columns);
            statements.push(format!(
                "DELETE FROM {target} USING {qualified_temp} WHERE {correlate}"
            ));
            statements.push(format!(
                "INSERT INTO {target} ({columns}) SELECT {columns} FROM {qualified_temp}"
            ));
        }

        if let Some(version) = version {
            if spec.schema.with_metadata() {
                statements.push(format!(
                    "DELETE FROM {target} WHERE \"_SDC_TABLE_VERSION\" IS NOT NULL \
                     AND \"_SDC_TABLE_VERSION\" < {version}"
                ));
            } else {
                warn!(
                    stream = %spec.stream,
                    version, "Ignoring version activation: metadata columns are disabled"
                );
            }
        }

        if self.config.hard_delete {
            statements.push(format!(
                "DELETE FROM {target} WHERE \"_SDC_DELETED_AT\" IS NOT NULL"
            ));
        }

        statements.push(format!("DROP TABLE {qualified_temp}"));
        statements
    }

    async fn create_table(&self, spec: &StreamSpec) -> Result<(), SyncError> {
        let mut definitions = column_definitions(spec);
        if !spec.key_columns.is_empty() {
            let keys: Vec<String> = spec.key_columns.iter().map(|k| quote_ident(k)).collect();
            definitions.push_str(&format!(", PRIMARY KEY ({})", keys.join(", ")));
        }

        let statement = format!(
            "CREATE TABLE IF NOT EXISTS {} ({definitions})",
            qualified(&spec.target_schema, &spec.table_name)
        );
        info!(stream = %spec.stream, "Creating table {}", spec.table_name);
        self.warehouse.execute(&statement).await?;

        if let Some(principals) = self.config.grants_for(spec.source_schema.as_deref()) {
            let statements =
                table_grant_statements(&spec.target_schema, &spec.table_name, principals);
            self.apply_grants(&statements).await;
        }

        self.cache_created_table(spec).await;
        Ok(())
    }

    async fn evolve_table(
        &self,
        spec: &StreamSpec,
        existing: &TableColumns,
    ) -> Result<(), SyncError> {
        let target = qualified(&spec.target_schema, &spec.table_name);
        let mut altered = false;

        for (name, column_type) in spec.schema.ordered_columns() {
            match existing.get(&name.to_uppercase()) {
                None => {
                    let statement = format!(
                        "ALTER TABLE {target} ADD COLUMN {} {}",
                        quote_ident(name),
                        column_type.sql()
                    );
                    info!(stream = %spec.stream, column = name, "Adding column");
                    self.warehouse.execute(&statement).await?;
                    altered = true;
                }
                Some(catalog) => {
                    if let Some(widened) = varchar_widening(catalog, column_type) {
                        let statement = format!(
                            "ALTER TABLE {target} ALTER COLUMN {} TYPE character varying({widened})",
                            quote_ident(name)
                        );
                        info!(
                            stream = %spec.stream,
                            column = name, widened, "Widening varchar column"
                        );
                        self.warehouse.execute(&statement).await?;
                        altered = true;
                    } else if !catalog_type_matches(catalog, column_type) {
                        // Never retype or drop; the declared change is
                        // logged and ignored.
                        warn!(
                            stream = %spec.stream,
                            column = name,
                            existing = %catalog.data_type,
                            declared = %column_type.sql(),
                            "Ignoring incompatible type change"
                        );
                    }
                }
            }
        }

        if altered {
            self.invalidate_cached_table(spec).await;
        }
        Ok(())
    }

    /// Columns of a table, from the cache or a live catalog lookup.
    /// `None` means the table does not exist.
    async fn table_columns(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Option<TableColumns>, SyncError> {
        if !self.config.disable_table_cache {
            let catalog = self.catalog.lock().await;
            if let Some(tables) = catalog.get(schema) {
                return Ok(tables.get(&table.to_uppercase()).cloned());
            }
        }

        let columns = self.warehouse.list_columns(schema).await?;
        let table_upper = table.to_uppercase();
        let matching: TableColumns = columns
            .into_iter()
            .filter(|c| c.table_name.to_uppercase() == table_upper)
            .map(|c| (c.column_name.to_uppercase(), c))
            .collect();

        Ok(if matching.is_empty() { None } else { Some(matching) })
    }

    /// Record a freshly created table in the cache so the next flush
    /// skips the existence probe.
    async fn cache_created_table(&self, spec: &StreamSpec) {
        if self.config.disable_table_cache {
            return;
        }
        let mut catalog = self.catalog.lock().await;
        let entry = catalog
            .entry(spec.target_schema.clone())
            .or_default()
            .entry(spec.table_name.to_uppercase())
            .or_default();
        for (name, column_type) in spec.schema.ordered_columns() {
            let (data_type, character_maximum_length) = catalog_shape(column_type);
            entry.insert(
                name.to_uppercase(),
                CatalogColumn {
                    table_name: spec.table_name.clone(),
                    column_name: name.to_string(),
                    data_type: data_type.to_string(),
                    character_maximum_length,
                },
            );
        }
    }

    async fn invalidate_cached_table(&self, spec: &StreamSpec) {
        if self.config.disable_table_cache {
            return;
        }
        let mut catalog = self.catalog.lock().await;
        if let Some(tables) = catalog.get_mut(&spec.target_schema) {
            tables.remove(&spec.table_name.to_uppercase());
        }
        // The next ensure_table repopulates the entry from
        // information_schema.
        if let Ok(columns) = self.warehouse.list_columns(&spec.target_schema).await {
            let entry = catalog.entry(spec.target_schema.clone()).or_default();
            for column in columns
                .into_iter()
                .filter(|c| c.table_name.to_uppercase() == spec.table_name.to_uppercase())
            {
                entry
                    .entry(column.table_name.to_uppercase())
                    .or_default()
                    .insert(column.column_name.to_uppercase(), column);
            }
        }
    }

    /// (target schema, principals) pairs for startup grants.
    fn schema_grant_pairs(&self) -> Vec<(String, GrantPrincipals)> {
        let mut pairs = Vec::new();
        if let (Some(schema), Some(principals)) = (
            &self.config.default_target_schema,
            &self.config.default_target_schema_select_permissions,
        ) {
            pairs.push((schema.clone(), principals.clone()));
        }
        for mapping in self.config.schema_mapping.values() {
            if let Some(principals) = &mapping.target_schema_select_permissions {
                pairs.push((mapping.target_schema.clone(), principals.clone()));
            }
        }
        pairs
    }

    /// Grants never fail a load: a missing principal is a warning.
    async fn apply_grants(&self, statements: &[String]) {
        for statement in statements {
            if let Err(e) = self.warehouse.execute(statement).await {
                warn!("Grant failed ({}): {}", statement, e);
            }
        }
    }
}

fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

fn schema_grant_statements(schema: &str, principals: &GrantPrincipals) -> Vec<String> {
    let (users, groups) = principals.resolve();
    let schema = quote_ident(schema);
    users
        .iter()
        .map(|user| format!("GRANT USAGE ON SCHEMA {schema} TO {}", quote_ident(user)))
        .chain(groups.iter().map(|group| {
            format!("GRANT USAGE ON SCHEMA {schema} TO GROUP {}", quote_ident(group))
        }))
        .collect()
}

fn table_grant_statements(schema: &str, table: &str, principals: &GrantPrincipals) -> Vec<String> {
    let (users, groups) = principals.resolve();
    let target = qualified(schema, table);
    users
        .iter()
        .map(|user| format!("GRANT SELECT ON {target} TO {}", quote_ident(user)))
        .chain(groups.iter().map(|group| {
            format!("GRANT SELECT ON {target} TO GROUP {}", quote_ident(group))
        }))
        .collect()
}

fn column_definitions(spec: &StreamSpec) -> String {
    spec.schema
        .ordered_columns()
        .iter()
        .map(|(name, column_type)| format!("{} {}", quote_ident(name), column_type.sql()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_list(spec: &StreamSpec) -> String {
    spec.schema
        .ordered_columns()
        .iter()
        .map(|(name, _)| quote_ident(name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn key_predicate(target: &str, temp: &str, key_columns: &[String]) -> String {
    key_columns
        .iter()
        .map(|key| {
            let key = quote_ident(key);
            format!("{target}.{key} = {temp}.{key}")
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// The catalog shape (`data_type`, char length) a column type produces.
fn catalog_shape(column_type: ColumnType) -> (&'static str, Option<i32>) {
    match column_type {
        ColumnType::Timestamp => ("timestamp without time zone", None),
        ColumnType::Date => ("date", None),
        ColumnType::Varchar(n) => ("character varying", Some(n as i32)),
        ColumnType::Numeric => ("numeric", None),
        ColumnType::Float => ("double precision", None),
        ColumnType::Boolean => ("boolean", None),
        ColumnType::BigInt => ("bigint", None),
        ColumnType::Super => ("super", None),
    }
}

fn catalog_type_matches(catalog: &CatalogColumn, column_type: ColumnType) -> bool {
    let (data_type, _) = catalog_shape(column_type);
    catalog.data_type.eq_ignore_ascii_case(data_type)
        // `float` surfaces as `double precision`; accept either spelling.
        || (matches!(column_type, ColumnType::Float)
            && catalog.data_type.eq_ignore_ascii_case("float"))
}

/// Returns the widened length when the declared VARCHAR outgrew the
/// existing column.
fn varchar_widening(catalog: &CatalogColumn, column_type: ColumnType) -> Option<u32> {
    let declared = column_type.varchar_length()?;
    if !catalog.data_type.eq_ignore_ascii_case("character varying") {
        return None;
    }
    match catalog.character_maximum_length {
        Some(existing) if (existing as u32) < declared => Some(declared),
        _ => None,
    }
}

/// Run `attempt` with bounded exponential backoff. Transient staging and
/// COPY failures retry before promoting to fatal.
async fn with_retries<T, F, Fut>(operation: &str, mut attempt: F) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut delay = RETRY_INITIAL_DELAY;
    let mut tries = 0;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if tries + 1 < RETRY_MAX_ATTEMPTS => {
                tries += 1;
                warn!(
                    "{operation} failed (attempt {tries}/{RETRY_MAX_ATTEMPTS}), \
                     retrying in {delay:?}: {e}"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_MAX_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
}
