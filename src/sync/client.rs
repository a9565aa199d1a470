//! Warehouse client seam.
//!
//! The sync layer talks to the warehouse through the [`Warehouse`]
//! trait: plain statement execution, multi-statement transactions, and
//! column introspection. Redshift speaks the Postgres wire protocol, so
//! the production implementation is an sqlx Postgres pool; tests plug in
//! an in-memory double.

use async_trait::async_trait;
use snafu::prelude::*;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;

use crate::config::Config;
use crate::error::{CatalogSnafu, ConnectSnafu, SqlSnafu, SyncError};

/// One column as reported by `information_schema.columns`.
#[derive(Debug, Clone)]
pub struct CatalogColumn {
    pub table_name: String,
    pub column_name: String,
    pub data_type: String,
    pub character_maximum_length: Option<i32>,
}

/// Thin SQL execution interface of the warehouse.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Execute one statement, returning the affected row count.
    async fn execute(&self, sql: &str) -> Result<u64, SyncError>;

    /// Execute statements atomically in one transaction.
    async fn execute_transaction(&self, statements: &[String]) -> Result<(), SyncError>;

    /// List all columns of every table in `schema`.
    async fn list_columns(&self, schema: &str) -> Result<Vec<CatalogColumn>, SyncError>;
}

/// Production warehouse client over a Postgres-wire connection pool.
pub struct RedshiftWarehouse {
    pool: PgPool,
}

impl RedshiftWarehouse {
    /// Open a pool sized for the flush worker bound (one connection per
    /// in-flight flush, plus one for the message loop's DDL).
    pub async fn connect(config: &Config, max_connections: u32) -> Result<Self, SyncError> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.dbname);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .context(ConnectSnafu)?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl Warehouse for RedshiftWarehouse {
    async fn execute(&self, sql: &str) -> Result<u64, SyncError> {
        let result = sqlx::query(sql)
            .execute(&self.pool)
            .await
            .context(SqlSnafu { statement: sql })?;
        Ok(result.rows_affected())
    }

    async fn execute_transaction(&self, statements: &[String]) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await.context(ConnectSnafu)?;
        for statement in statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .context(SqlSnafu {
                    statement: statement.clone(),
                })?;
        }
        tx.commit().await.context(ConnectSnafu)?;
        Ok(())
    }

    async fn list_columns(&self, schema: &str) -> Result<Vec<CatalogColumn>, SyncError> {
        let rows = sqlx::query(
            "SELECT table_name, column_name, data_type, character_maximum_length \
             FROM information_schema.columns WHERE table_schema = $1",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await
        .context(CatalogSnafu { schema })?;

        let columns = rows
            .into_iter()
            .map(|row| CatalogColumn {
                table_name: row.get("table_name"),
                column_name: row.get("column_name"),
                data_type: row.get("data_type"),
                character_maximum_length: row.get("character_maximum_length"),
            })
            .collect();

        Ok(columns)
    }
}
