//! Protocol tests: the full message loop against an in-memory warehouse
//! and object store.

use object_store::memory::InMemory;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use target_redshift::Target;
use target_redshift::config::Config;
use target_redshift::error::TargetError;
use target_redshift::storage::StageStore;
use target_redshift::target::TargetStats;
use target_redshift::testing::{CollectingStateSink, MockWarehouse};

struct Harness {
    warehouse: Arc<MockWarehouse>,
    stage: StageStore,
    sink: CollectingStateSink,
    scratch_root: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self {
            warehouse: Arc::new(MockWarehouse::new()),
            stage: StageStore::new(Arc::new(InMemory::new()), "test-bucket"),
            sink: CollectingStateSink::default(),
            scratch_root: TempDir::new().unwrap(),
        }
    }

    fn config(&self) -> Config {
        let mut config: Config = serde_json::from_value(json!({
            "host": "localhost",
            "user": "dummy",
            "password": "dummy",
            "dbname": "dummy",
            "s3_bucket": "test-bucket",
            "default_target_schema": "analytics",
            "aws_access_key_id": "AKIA_TEST",
            "aws_secret_access_key": "SECRET_TEST"
        }))
        .unwrap();
        config.temp_dir = Some(self.scratch_root.path().to_path_buf());
        config
    }

    async fn run(&self, config: Config, input: &str) -> Result<TargetStats, TargetError> {
        let target = Target::new(
            Arc::new(config),
            self.warehouse.clone(),
            self.stage.clone(),
            Box::new(self.sink.clone()),
            CancellationToken::new(),
        )
        .unwrap();
        target.run(input.as_bytes()).await
    }

    /// The per-run scratch directory must be gone after any exit.
    fn scratch_entries(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.scratch_root.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }
}

fn schema_line(stream: &str, properties: serde_json::Value, keys: &[&str]) -> String {
    json!({
        "type": "SCHEMA",
        "stream": stream,
        "schema": {"type": "object", "properties": properties},
        "key_properties": keys
    })
    .to_string()
}

fn record_line(stream: &str, record: serde_json::Value) -> String {
    json!({"type": "RECORD", "stream": stream, "record": record}).to_string()
}

#[tokio::test]
async fn basic_load_deduplicates_by_primary_key() {
    let harness = Harness::new();
    let input = [
        schema_line(
            "orders",
            json!({"id": {"type": "integer"}, "name": {"type": ["null", "string"]}}),
            &["id"],
        ),
        record_line("orders", json!({"id": 1, "name": "a"})),
        record_line("orders", json!({"id": 2, "name": "b"})),
        record_line("orders", json!({"id": 1, "name": "c"})),
    ]
    .join("\n");

    let stats = harness.run(harness.config(), &input).await.unwrap();

    // Last-writer-wins within the batch: two distinct keys load.
    assert_eq!(stats.records_received, 3);
    assert_eq!(stats.rows_loaded, 2);
    assert_eq!(stats.batches_flushed, 1);
    assert_eq!(stats.streams, 1);

    let statements = harness.warehouse.statements();
    let create = statements
        .iter()
        .find(|s| s.starts_with("CREATE TABLE IF NOT EXISTS"))
        .unwrap();
    assert!(create.contains("\"analytics\".\"ORDERS\""));
    assert!(create.contains("\"ID\" numeric(38,0)"));
    assert!(create.contains("PRIMARY KEY (\"ID\")"));

    let transactions = harness.warehouse.transactions();
    assert_eq!(transactions.len(), 1);
    assert!(transactions[0][0].starts_with("DELETE FROM \"analytics\".\"ORDERS\" USING"));
    assert!(transactions[0][1].starts_with("INSERT INTO \"analytics\".\"ORDERS\""));

    assert!(harness.scratch_entries().is_empty());
}

#[tokio::test]
async fn staged_object_is_deleted_after_the_load() {
    let harness = Harness::new();
    let input = [
        schema_line("orders", json!({"id": {"type": "integer"}}), &["id"]),
        record_line("orders", json!({"id": 1})),
    ]
    .join("\n");

    harness.run(harness.config(), &input).await.unwrap();

    // Recover the staged key from the COPY statement and check the
    // object store no longer holds it.
    let statements = harness.warehouse.statements();
    let copy = statements.iter().find(|s| s.starts_with("COPY")).unwrap();
    let uri = copy.split("FROM '").nth(1).unwrap().split('\'').next().unwrap();
    let key = uri.strip_prefix("s3://test-bucket/").unwrap();
    assert!(!harness.stage.exists(key).await.unwrap());
}

#[tokio::test]
async fn flattening_disabled_yields_a_super_column() {
    let harness = Harness::new();
    let input = [
        schema_line(
            "orders",
            json!({
                "id": {"type": "integer"},
                "a": {"type": ["null", "object"], "properties": {"b": {"type": "integer"}}}
            }),
            &["id"],
        ),
        record_line("orders", json!({"id": 1, "a": {"b": 7}})),
    ]
    .join("\n");

    harness.run(harness.config(), &input).await.unwrap();

    let statements = harness.warehouse.statements();
    let create = statements.iter().find(|s| s.starts_with("CREATE TABLE IF NOT EXISTS")).unwrap();
    assert!(create.contains("\"A\" super"));
    assert!(!create.contains("A__B"));
}

#[tokio::test]
async fn flattening_one_level_yields_typed_leaf_columns() {
    let harness = Harness::new();
    let mut config = harness.config();
    config.data_flattening_max_level = 1;

    let input = [
        schema_line(
            "orders",
            json!({
                "id": {"type": "integer"},
                "a": {"type": ["null", "object"], "properties": {"b": {"type": "integer"}}}
            }),
            &["id"],
        ),
        record_line("orders", json!({"id": 1, "a": {"b": 7}})),
    ]
    .join("\n");

    harness.run(config, &input).await.unwrap();

    let statements = harness.warehouse.statements();
    let create = statements.iter().find(|s| s.starts_with("CREATE TABLE IF NOT EXISTS")).unwrap();
    assert!(create.contains("\"A__B\" numeric(38,0)"));
    assert!(!create.contains("\"A\" super"));
}

#[tokio::test]
async fn hard_delete_removes_soft_deleted_rows_after_the_merge() {
    let harness = Harness::new();
    let mut config = harness.config();
    config.hard_delete = true;

    let input = [
        schema_line("orders", json!({"id": {"type": "integer"}}), &["id"]),
        record_line("orders", json!({"id": 1, "_sdc_deleted_at": "2024-01-01T00:00:00Z"})),
        record_line("orders", json!({"id": 2, "_sdc_deleted_at": null})),
    ]
    .join("\n");

    let stats = harness.run(config, &input).await.unwrap();
    assert_eq!(stats.rows_loaded, 2);

    // hard_delete implies metadata columns.
    let statements = harness.warehouse.statements();
    let create = statements.iter().find(|s| s.starts_with("CREATE TABLE IF NOT EXISTS")).unwrap();
    assert!(create.contains("\"_SDC_DELETED_AT\" timestamp without time zone"));

    let transactions = harness.warehouse.transactions();
    let hard_delete = transactions[0]
        .iter()
        .find(|s| s.contains("\"_SDC_DELETED_AT\" IS NOT NULL"))
        .unwrap();
    assert!(hard_delete.starts_with("DELETE FROM \"analytics\".\"ORDERS\""));
}

#[tokio::test]
async fn reserved_identifiers_are_quoted_in_ddl() {
    let harness = Harness::new();
    let mut config = harness.config();
    config.schema_mapping.insert(
        "public".to_string(),
        target_redshift::config::SchemaMapping {
            target_schema: "repl_public".to_string(),
            target_schema_select_permissions: None,
        },
    );

    let input = [
        schema_line(
            "public-order",
            json!({"id": {"type": "integer"}, "select": {"type": ["null", "string"]}}),
            &["id"],
        ),
        record_line("public-order", json!({"id": 1, "select": "x"})),
    ]
    .join("\n");

    let stats = harness.run(config, &input).await.unwrap();
    assert_eq!(stats.rows_loaded, 1);

    let statements = harness.warehouse.statements();
    let create = statements.iter().find(|s| s.starts_with("CREATE TABLE IF NOT EXISTS")).unwrap();
    assert!(create.contains("\"repl_public\".\"ORDER\""));
    assert!(create.contains("\"SELECT\" character varying(10000)"));

    let copy = statements.iter().find(|s| s.starts_with("COPY")).unwrap();
    assert!(copy.contains("\"SELECT\""));
}

#[tokio::test]
async fn batch_boundaries_gate_state_emission_in_order() {
    let harness = Harness::new();
    let mut config = harness.config();
    config.batch_size_rows = 2;

    let input = [
        schema_line("orders", json!({"id": {"type": "integer"}}), &["id"]),
        record_line("orders", json!({"id": 1})),
        record_line("orders", json!({"id": 2})),
        json!({"type": "STATE", "value": {"a": 1}}).to_string(),
        record_line("orders", json!({"id": 3})),
        record_line("orders", json!({"id": 4})),
        json!({"type": "STATE", "value": {"a": 2}}).to_string(),
    ]
    .join("\n");

    let stats = harness.run(config, &input).await.unwrap();

    assert_eq!(stats.rows_loaded, 4);
    assert_eq!(stats.batches_flushed, 2);
    assert_eq!(stats.states_emitted, 2);
    assert_eq!(harness.sink.emitted(), vec![json!({"a": 1}), json!({"a": 2})]);
    assert_eq!(harness.warehouse.transactions().len(), 2);
    assert!(harness.scratch_entries().is_empty());
}

#[tokio::test]
async fn state_is_withheld_when_its_gating_flush_fails() {
    let harness = Harness::new();
    harness.warehouse.fail_matching("COPY");
    let mut config = harness.config();
    config.batch_size_rows = 1;

    let input = [
        schema_line("orders", json!({"id": {"type": "integer"}}), &["id"]),
        record_line("orders", json!({"id": 1})),
        json!({"type": "STATE", "value": {"a": 1}}).to_string(),
    ]
    .join("\n");

    let err = harness.run(config, &input).await.unwrap_err();
    assert!(matches!(err, TargetError::Sync { .. }));
    assert!(harness.sink.emitted().is_empty());

    // The scratch directory is swept on the failure path too.
    assert!(harness.scratch_entries().is_empty());
}

#[tokio::test]
async fn unknown_message_type_aborts_without_flushing() {
    let harness = Harness::new();
    let input = [
        schema_line("orders", json!({"id": {"type": "integer"}}), &["id"]),
        record_line("orders", json!({"id": 1})),
        json!({"type": "FLUSH_NOW"}).to_string(),
    ]
    .join("\n");

    let err = harness.run(harness.config(), &input).await.unwrap_err();
    assert!(matches!(err, TargetError::Protocol { .. }));

    // No COPY ran: staged rows are not partially flushed on a protocol
    // error.
    let statements = harness.warehouse.statements();
    assert!(!statements.iter().any(|s| s.starts_with("COPY")));
    assert!(harness.scratch_entries().is_empty());
}

#[tokio::test]
async fn multiple_streams_load_independently() {
    let harness = Harness::new();
    let input = [
        schema_line("orders", json!({"id": {"type": "integer"}}), &["id"]),
        schema_line("users", json!({"id": {"type": "integer"}}), &["id"]),
        record_line("orders", json!({"id": 1})),
        record_line("users", json!({"id": 1})),
        record_line("users", json!({"id": 2})),
    ]
    .join("\n");

    let stats = harness.run(harness.config(), &input).await.unwrap();

    assert_eq!(stats.streams, 2);
    assert_eq!(stats.rows_loaded, 3);
    assert_eq!(stats.batches_flushed, 2);

    let statements = harness.warehouse.statements();
    let creates: Vec<&String> = statements
        .iter()
        .filter(|s| s.starts_with("CREATE TABLE IF NOT EXISTS"))
        .collect();
    assert_eq!(creates.len(), 2);
    assert!(creates.iter().any(|s| s.contains("\"ORDERS\"")));
    assert!(creates.iter().any(|s| s.contains("\"USERS\"")));
}

#[tokio::test]
async fn flush_all_streams_drains_every_batch_on_any_trigger() {
    let harness = Harness::new();
    let mut config = harness.config();
    config.batch_size_rows = 2;
    config.flush_all_streams = true;

    let input = [
        schema_line("orders", json!({"id": {"type": "integer"}}), &["id"]),
        schema_line("users", json!({"id": {"type": "integer"}}), &["id"]),
        record_line("users", json!({"id": 9})),
        record_line("orders", json!({"id": 1})),
        record_line("orders", json!({"id": 2})),
    ]
    .join("\n");

    let stats = harness.run(config, &input).await.unwrap();

    // The orders batch filling up also flushed the single staged users
    // row.
    assert_eq!(stats.batches_flushed, 2);
    assert_eq!(stats.rows_loaded, 3);
}

#[tokio::test]
async fn activate_version_filters_stale_rows_with_metadata_columns() {
    let harness = Harness::new();
    let mut config = harness.config();
    config.add_metadata_columns = true;

    let input = [
        schema_line("orders", json!({"id": {"type": "integer"}}), &["id"]),
        json!({"type": "ACTIVATE_VERSION", "stream": "orders", "version": 5}).to_string(),
        record_line("orders", json!({"id": 1})),
    ]
    .join("\n");

    harness.run(config, &input).await.unwrap();

    let transactions = harness.warehouse.transactions();
    assert!(transactions[0]
        .iter()
        .any(|s| s.contains("\"_SDC_TABLE_VERSION\" < 5")));
}
