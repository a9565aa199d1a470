//! Stream registry.
//!
//! The message loop owns the registry. It maps stream names to their
//! current flattened schema, normalizer, stage writer, counters, and
//! per-stream flush lock. Flush submissions receive an immutable spec
//! snapshot plus the sealed batch, so workers never touch the registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use snafu::ResultExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::Config;
use crate::emit;
use crate::error::{
    MessageBeforeSchemaSnafu, NoTargetSchemaSnafu, PrimaryKeyNotFoundSnafu,
    PrimaryKeyRequiredSnafu, ProtocolSnafu, RecordSnafu, SchemaSnafu, TargetError,
    TargetStorageSnafu,
};
use crate::message::{ActivateVersionMessage, RecordMessage, SchemaMessage};
use crate::metrics::events::RecordsReceived;
use crate::record::RecordNormalizer;
use crate::schema::FlattenedSchema;
use crate::schema::names::{safe_column_name, safe_table_name, stream_name_to_parts};
use crate::stage::{StageWriter, StagedBatch};

/// Field separator inside a composite primary-key tuple.
const KEY_SEPARATOR: char = '\u{1f}';

/// Immutable warehouse-facing description of a stream, snapshotted per
/// flush.
#[derive(Debug)]
pub struct StreamSpec {
    pub stream: String,
    /// Source schema component of the compound stream name, used for
    /// grant resolution.
    pub source_schema: Option<String>,
    pub target_schema: String,
    pub table_name: String,
    pub schema: Arc<FlattenedSchema>,
    pub key_columns: Vec<String>,
}

/// One sealed batch plus everything a flush worker needs to load it.
#[derive(Debug)]
pub struct FlushItem {
    pub spec: Arc<StreamSpec>,
    pub batch: StagedBatch,
    /// Serializes flushes of the same stream.
    pub lock: Arc<Mutex<()>>,
    /// Table version activated with this flush, if any.
    pub version: Option<i64>,
}

struct StreamState {
    spec: Arc<StreamSpec>,
    normalizer: RecordNormalizer,
    writer: StageWriter,
    flush_lock: Arc<Mutex<()>>,
    /// Positions of the key columns within a normalized row.
    key_indexes: Vec<usize>,
    active_version: Option<i64>,
    pending_version: Option<i64>,
    records_received: u64,
}

/// Mapping from stream name to per-stream state, owned by the message
/// loop.
pub struct StreamRegistry {
    config: Arc<Config>,
    scratch_dir: PathBuf,
    streams: HashMap<String, StreamState>,
    /// Monotonic message index, feeds `_SDC_SEQUENCE`.
    sequence: u64,
}

impl StreamRegistry {
    pub fn new(config: Arc<Config>, scratch_dir: PathBuf) -> Self {
        Self {
            config,
            scratch_dir,
            streams: HashMap::new(),
            sequence: 0,
        }
    }

    /// Handle a SCHEMA message: create the stream or re-key it when the
    /// flattened column set changed. If rows are already staged under
    /// the old columns, they are sealed first and returned for flushing.
    pub fn on_schema(&mut self, msg: &SchemaMessage) -> Result<Option<FlushItem>, TargetError> {
        let (spec, key_indexes) = self.build_spec(msg)?;
        let spec = Arc::new(spec);
        let validate_records = self.config.validate_records;

        if let Some(state) = self.streams.get_mut(&msg.stream) {
            if state.spec.schema == spec.schema && state.spec.key_columns == spec.key_columns {
                debug!(stream = %msg.stream, "SCHEMA unchanged");
                return Ok(None);
            }

            info!(stream = %msg.stream, "SCHEMA changed, re-keying stream");
            // Staged rows follow the old column order and must load
            // before the spec changes underneath them.
            let pending = state
                .writer
                .rotate()
                .context(TargetStorageSnafu)?
                .map(|batch| FlushItem {
                    spec: state.spec.clone(),
                    batch,
                    lock: state.flush_lock.clone(),
                    version: state.pending_version.take(),
                });

            state.normalizer =
                RecordNormalizer::new(msg.stream.clone(), spec.schema.clone(), validate_records);
            state.spec = spec;
            state.key_indexes = key_indexes;
            return Ok(pending);
        }

        info!(
            stream = %msg.stream,
            table = %spec.table_name,
            columns = spec.schema.ordered_columns().len(),
            "Registered stream"
        );
        let state = self.new_state(spec, key_indexes);
        self.streams.insert(msg.stream.clone(), state);
        Ok(None)
    }

    /// Handle a RECORD message. Returns true when the stream's batch
    /// reached `batch_size_rows`.
    pub fn on_record(&mut self, msg: &RecordMessage) -> Result<bool, TargetError> {
        self.sequence += 1;
        let sequence = self.sequence;
        let batch_size_rows = self.config.batch_size_rows;

        let state = self.streams.get_mut(&msg.stream).ok_or_else(|| {
            MessageBeforeSchemaSnafu {
                message_type: "RECORD",
                stream: msg.stream.clone(),
            }
            .build()
        })
        .context(ProtocolSnafu)?;

        emit!(RecordsReceived { count: 1 });

        let version = msg.version.or(state.active_version);
        let fields = state
            .normalizer
            .normalize(msg, sequence, version)
            .context(RecordSnafu)?;

        let key = if state.key_indexes.is_empty() {
            None
        } else {
            let mut key = String::new();
            for &index in &state.key_indexes {
                key.push_str(&fields[index]);
                key.push(KEY_SEPARATOR);
            }
            Some(key)
        };

        state.writer.append(fields, key);
        state.records_received += 1;

        Ok(state.writer.rows() >= batch_size_rows)
    }

    /// Handle an ACTIVATE_VERSION message: the version switch applies at
    /// the stream's next flush.
    pub fn on_activate_version(&mut self, msg: &ActivateVersionMessage) -> Result<(), TargetError> {
        let state = self
            .streams
            .get_mut(&msg.stream)
            .ok_or_else(|| {
                MessageBeforeSchemaSnafu {
                    message_type: "ACTIVATE_VERSION",
                    stream: msg.stream.clone(),
                }
                .build()
            })
            .context(ProtocolSnafu)?;

        info!(stream = %msg.stream, version = msg.version, "Version activation scheduled");
        state.active_version = Some(msg.version);
        state.pending_version = Some(msg.version);
        Ok(())
    }

    /// Seal the stream's current batch for flushing, if it has rows. A
    /// pending version switch rides along with the sealed batch.
    pub fn seal(&mut self, stream: &str) -> Result<Option<FlushItem>, TargetError> {
        let Some(state) = self.streams.get_mut(stream) else {
            return Ok(None);
        };

        let batch = state.writer.rotate().context(TargetStorageSnafu)?;
        Ok(batch.map(|batch| FlushItem {
            spec: state.spec.clone(),
            batch,
            lock: state.flush_lock.clone(),
            version: state.pending_version.take(),
        }))
    }

    /// Streams that currently hold staged rows.
    pub fn streams_with_rows(&self) -> Vec<String> {
        self.streams
            .iter()
            .filter(|(_, state)| state.writer.rows() > 0)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Number of registered streams.
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    /// Total records received across all streams.
    pub fn total_records(&self) -> u64 {
        self.streams.values().map(|s| s.records_received).sum()
    }

    fn new_state(&self, spec: Arc<StreamSpec>, key_indexes: Vec<usize>) -> StreamState {
        StreamState {
            normalizer: RecordNormalizer::new(
                spec.stream.clone(),
                spec.schema.clone(),
                self.config.validate_records,
            ),
            writer: StageWriter::new(
                spec.stream.clone(),
                self.scratch_dir.clone(),
                self.config.compression,
                self.config.slices,
            ),
            flush_lock: Arc::new(Mutex::new(())),
            key_indexes,
            active_version: None,
            pending_version: None,
            records_received: 0,
            spec,
        }
    }

    fn build_spec(&self, msg: &SchemaMessage) -> Result<(StreamSpec, Vec<usize>), TargetError> {
        let parts = stream_name_to_parts(&msg.stream, '-');
        let target_schema = self
            .config
            .target_schema(parts.schema.as_deref())
            .ok_or_else(|| {
                NoTargetSchemaSnafu {
                    stream: msg.stream.clone(),
                }
                .build()
            })
            .context(SchemaSnafu)?;

        let schema = FlattenedSchema::from_declared(
            &msg.stream,
            &msg.schema,
            self.config.data_flattening_max_level,
            self.config.default_varchar_length(),
            self.config.metadata_columns_enabled(),
        )
        .context(SchemaSnafu)?;

        if msg.key_properties.is_empty() && self.config.primary_key_required {
            return PrimaryKeyRequiredSnafu {
                stream: msg.stream.clone(),
            }
            .fail()
            .context(SchemaSnafu);
        }

        let ordered = schema.ordered_columns();
        let mut key_columns = Vec::with_capacity(msg.key_properties.len());
        let mut key_indexes = Vec::with_capacity(msg.key_properties.len());
        for property in &msg.key_properties {
            let safe = safe_column_name(property);
            let index = ordered.iter().position(|(name, _)| *name == safe);
            match index {
                Some(index) => {
                    key_columns.push(safe);
                    key_indexes.push(index);
                }
                None => {
                    return PrimaryKeyNotFoundSnafu {
                        stream: msg.stream.clone(),
                        property: property.clone(),
                    }
                    .fail()
                    .context(SchemaSnafu);
                }
            }
        }

        Ok((
            StreamSpec {
                stream: msg.stream.clone(),
                source_schema: parts.schema,
                target_schema,
                table_name: safe_table_name(&parts.table),
                schema: Arc::new(schema),
                key_columns,
            },
            key_indexes,
        ))
    }
}
