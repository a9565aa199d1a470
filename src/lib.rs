//! target-redshift: a streaming ingest target for Amazon Redshift.
//!
//! The engine consumes a line-delimited tap protocol on its input
//! stream (SCHEMA, RECORD, STATE, ACTIVATE_VERSION messages), batches
//! records into compressed CSV stage files, loads them through S3 with
//! COPY into transient tables, merges into the targets with upsert
//! semantics, and echoes STATE checkpoints once the records they cover
//! are durable.
//!
//! # Example
//!
//! ```ignore
//! use target_redshift::{Config, run_target, error::TargetError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), TargetError> {
//!     let config = Config::from_file("config.json")?;
//!     let stats = run_target(config).await?;
//!     println!("Loaded {} rows", stats.rows_loaded);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod flush;
pub mod message;
pub mod metrics;
pub mod record;
pub mod registry;
pub mod schema;
pub mod stage;
pub mod storage;
pub mod sync;
pub mod target;

#[doc(hidden)]
pub mod testing;

// Re-export main types
pub use config::Config;
pub use storage::StageStore;
pub use target::{Target, TargetStats, run_target};
