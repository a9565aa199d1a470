//! In-memory test doubles for the warehouse and state seams.
//!
//! Used by unit tests and the protocol tests in `tests/`; nothing here
//! ships in a production code path.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{FailedSnafu, SyncError};
use crate::flush::StateSink;
use crate::sync::client::{CatalogColumn, Warehouse};

use snafu::prelude::*;

/// Records every statement, supports canned catalogs, injected delays
/// and failures.
#[derive(Default)]
pub struct MockWarehouse {
    statements: Mutex<Vec<String>>,
    transactions: Mutex<Vec<Vec<String>>>,
    catalog: Mutex<HashMap<String, Vec<CatalogColumn>>>,
    catalog_lookups: AtomicUsize,
    delay_matching: Mutex<Option<(String, Duration)>>,
    fail_matching: Mutex<Option<String>>,
    fail_transactions: Mutex<bool>,
}

impl MockWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// All statements run through `execute`, in order.
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    /// All committed transactions, each as its statement list.
    pub fn transactions(&self) -> Vec<Vec<String>> {
        self.transactions.lock().unwrap().clone()
    }

    pub fn catalog_lookups(&self) -> usize {
        self.catalog_lookups.load(Ordering::Relaxed)
    }

    /// Seed `information_schema`-style rows for one table.
    pub fn set_catalog(
        &self,
        schema: &str,
        table: &str,
        columns: &[(&str, &str, Option<i32>)],
    ) {
        let mut catalog = self.catalog.lock().unwrap();
        let entry = catalog.entry(schema.to_string()).or_default();
        for (name, data_type, max_length) in columns {
            entry.push(CatalogColumn {
                table_name: table.to_string(),
                column_name: (*name).to_string(),
                data_type: (*data_type).to_string(),
                character_maximum_length: *max_length,
            });
        }
    }

    /// Sleep before executing statements containing `pattern`.
    pub fn delay_matching(&self, pattern: &str, delay: Duration) {
        *self.delay_matching.lock().unwrap() = Some((pattern.to_string(), delay));
    }

    /// Fail statements containing `pattern`.
    pub fn fail_matching(&self, pattern: &str) {
        *self.fail_matching.lock().unwrap() = Some(pattern.to_string());
    }

    /// Fail every transaction.
    pub fn fail_transactions(&self) {
        *self.fail_transactions.lock().unwrap() = true;
    }

    async fn run_statement(&self, sql: &str) -> Result<u64, SyncError> {
        let delay = self.delay_matching.lock().unwrap().clone();
        if let Some((pattern, delay)) = delay {
            if sql.contains(&pattern) {
                tokio::time::sleep(delay).await;
            }
        }

        let failure = self.fail_matching.lock().unwrap().clone();
        self.statements.lock().unwrap().push(sql.to_string());

        if let Some(pattern) = failure {
            if sql.contains(&pattern) {
                return FailedSnafu {
                    message: format!("injected failure for '{pattern}'"),
                }
                .fail();
            }
        }
        Ok(0)
    }
}

#[async_trait]
impl Warehouse for MockWarehouse {
    async fn execute(&self, sql: &str) -> Result<u64, SyncError> {
        self.run_statement(sql).await
    }

    async fn execute_transaction(&self, statements: &[String]) -> Result<(), SyncError> {
        if *self.fail_transactions.lock().unwrap() {
            return FailedSnafu {
                message: "injected transaction failure",
            }
            .fail();
        }
        for statement in statements {
            self.run_statement(statement).await?;
        }
        self.transactions.lock().unwrap().push(statements.to_vec());
        Ok(())
    }

    async fn list_columns(&self, schema: &str) -> Result<Vec<CatalogColumn>, SyncError> {
        self.catalog_lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .catalog
            .lock()
            .unwrap()
            .get(schema)
            .cloned()
            .unwrap_or_default())
    }
}

/// State sink that collects emitted checkpoints for assertions.
#[derive(Clone, Default)]
pub struct CollectingStateSink {
    emitted: Arc<Mutex<Vec<Value>>>,
}

impl CollectingStateSink {
    pub fn emitted(&self) -> Vec<Value> {
        self.emitted.lock().unwrap().clone()
    }
}

impl StateSink for CollectingStateSink {
    fn emit(&mut self, value: &Value) -> std::io::Result<()> {
        self.emitted.lock().unwrap().push(value.clone());
        Ok(())
    }
}
