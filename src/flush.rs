//! Flush orchestration.
//!
//! Sealed batches are loaded by a bounded pool of worker tasks. Flushes
//! of distinct streams run concurrently; flushes of the same stream
//! serialize on the stream's lock. STATE checkpoints are gated on flush
//! sequence numbers: a checkpoint captured at loop time T is emitted
//! only once every flush submitted at time <= T has committed.

use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::emit;
use crate::error::{SyncError, TargetError};
use crate::metrics::events::{ActiveFlushes, StateEmitted};
use crate::registry::FlushItem;
use crate::sync::DbSync;

/// Where gated STATE messages go. Production writes stdout; tests
/// collect.
pub trait StateSink: Send {
    fn emit(&mut self, value: &Value) -> std::io::Result<()>;
}

/// Emits STATE messages on stdout, one compact JSON document per line.
pub struct StdoutStateSink;

impl StateSink for StdoutStateSink {
    fn emit(&mut self, value: &Value) -> std::io::Result<()> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{value}")?;
        out.flush()
    }
}

/// Totals accumulated over the orchestrator's lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushStats {
    pub batches_flushed: u64,
    pub rows_loaded: u64,
    pub states_emitted: u64,
}

/// Bounded-parallelism flush pool with sequence-gated state emission.
pub struct FlushOrchestrator {
    db: Arc<DbSync>,
    config: Arc<Config>,
    tasks: JoinSet<(u64, Result<u64, SyncError>)>,
    next_sequence: u64,
    /// Sequence numbers of in-flight flushes.
    outstanding: BTreeSet<u64>,
    /// (gate, state): emit once no outstanding sequence is below gate.
    pending_states: VecDeque<(u64, Value)>,
    state_sink: Box<dyn StateSink>,
    stats: FlushStats,
    failure: Option<TargetError>,
}

impl FlushOrchestrator {
    pub fn new(db: Arc<DbSync>, config: Arc<Config>, state_sink: Box<dyn StateSink>) -> Self {
        Self {
            db,
            config,
            tasks: JoinSet::new(),
            next_sequence: 0,
            outstanding: BTreeSet::new(),
            pending_states: VecDeque::new(),
            state_sink,
            stats: FlushStats::default(),
            failure: None,
        }
    }

    /// Worker-pool bound for the current number of active streams.
    fn pool_limit(&self, active_streams: usize) -> usize {
        let effective = match self.config.parallelism {
            n if n > 0 => n as usize,
            n if n < 0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
            _ => active_streams.max(1),
        };
        effective.clamp(1, self.config.max_parallelism)
    }

    /// Submit one sealed batch. Blocks (processing completions) while
    /// the pool is at its bound.
    pub async fn submit(&mut self, item: FlushItem, active_streams: usize) {
        let limit = self.pool_limit(active_streams);
        while self.tasks.len() >= limit {
            if let Some(result) = self.tasks.join_next().await {
                self.process_completion(result);
            }
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.outstanding.insert(sequence);

        debug!(
            stream = %item.spec.stream,
            rows = item.batch.rows,
            sequence,
            "Submitting flush"
        );

        let db = self.db.clone();
        self.tasks.spawn(async move {
            // Same-stream flushes serialize here; the registry already
            // handed us a fresh writer, so ingestion continues.
            let _guard = item.lock.lock().await;
            let result = db.load_batch(&item.spec, &item.batch, item.version).await;
            if result.is_ok() {
                item.batch.remove_files();
            }
            (sequence, result)
        });

        emit!(ActiveFlushes {
            count: self.tasks.len()
        });
    }

    /// Capture a STATE checkpoint, gated on everything submitted so far.
    /// Checkpoints sharing a flush point coalesce to the most recent.
    pub fn queue_state(&mut self, value: Value) {
        let gate = self.next_sequence;
        match self.pending_states.back_mut() {
            Some((pending_gate, pending)) if *pending_gate == gate => *pending = value,
            _ => self.pending_states.push_back((gate, value)),
        }
        self.try_emit_states();
    }

    /// Process any finished flushes without blocking.
    pub fn pump(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            self.process_completion(result);
        }
    }

    /// Whether a flush has failed; the loop must submit nothing more.
    pub fn has_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Drain all in-flight flushes and emit the remaining states.
    pub async fn finish(mut self) -> Result<FlushStats, TargetError> {
        while let Some(result) = self.tasks.join_next().await {
            self.process_completion(result);
        }
        emit!(ActiveFlushes { count: 0 });

        match self.failure {
            Some(failure) => Err(failure),
            None => Ok(self.stats),
        }
    }

    /// Shutdown path: wait up to `grace` for in-flight flushes, then
    /// abort whatever is left.
    pub async fn finish_within(mut self, grace: Duration) -> FlushStats {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let next = tokio::time::timeout_at(deadline, self.tasks.join_next()).await;
            match next {
                Ok(Some(result)) => self.process_completion(result),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Grace period elapsed with {} flushes in flight, aborting",
                        self.tasks.len()
                    );
                    self.tasks.abort_all();
                    break;
                }
            }
        }
        emit!(ActiveFlushes { count: 0 });
        self.stats
    }

    fn process_completion(
        &mut self,
        result: Result<(u64, Result<u64, SyncError>), tokio::task::JoinError>,
    ) {
        emit!(ActiveFlushes {
            count: self.tasks.len()
        });

        match result {
            Ok((sequence, Ok(rows))) => {
                self.outstanding.remove(&sequence);
                self.stats.batches_flushed += 1;
                self.stats.rows_loaded += rows;
                self.try_emit_states();
            }
            Ok((sequence, Err(e))) => {
                self.outstanding.remove(&sequence);
                error!(sequence, "Flush failed: {}", e);
                if self.failure.is_none() {
                    self.failure = Some(TargetError::Sync { source: e });
                }
            }
            Err(e) => {
                error!("Flush task join failed: {}", e);
                if self.failure.is_none() {
                    self.failure = Some(TargetError::TaskJoin { source: e });
                }
            }
        }
    }

    /// Emit every pending state whose gate is satisfied, in order.
    fn try_emit_states(&mut self) {
        if self.failure.is_some() {
            return;
        }
        let min_outstanding = self.outstanding.first().copied();
        while let Some((gate, _)) = self.pending_states.front() {
            let ready = min_outstanding.is_none_or(|min| *gate <= min);
            if !ready {
                break;
            }
            let (_, value) = self.pending_states.pop_front().expect("front checked above");
            if let Err(e) = self.state_sink.emit(&value) {
                self.failure = Some(TargetError::EmitState { source: e });
                return;
            }
            self.stats.states_emitted += 1;
            emit!(StateEmitted);
            info!("Emitted state checkpoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::registry::StreamRegistry;
    use crate::storage::StageStore;
    use crate::testing::{CollectingStateSink, MockWarehouse};
    use object_store::memory::InMemory;
    use serde_json::json;
    use tempfile::TempDir;

    fn orchestrator(
        warehouse: Arc<MockWarehouse>,
        config: crate::config::Config,
    ) -> (FlushOrchestrator, CollectingStateSink) {
        let mut config = config;
        config.aws_access_key_id = Some("AKIA_TEST".to_string());
        config.aws_secret_access_key = Some("SECRET_TEST".to_string());
        let config = Arc::new(config);
        let stage = StageStore::new(Arc::new(InMemory::new()), "test-bucket");
        let db = Arc::new(DbSync::new(config.clone(), warehouse, stage).unwrap());
        let sink = CollectingStateSink::default();
        let orchestrator = FlushOrchestrator::new(db, config, Box::new(sink.clone()));
        (orchestrator, sink)
    }

    fn flush_item(registry: &mut StreamRegistry) -> FlushItem {
        registry
            .on_schema(&crate::message::SchemaMessage {
                stream: "orders".to_string(),
                schema: json!({
                    "type": "object",
                    "properties": {"id": {"type": "integer"}}
                }),
                key_properties: vec!["id".to_string()],
            })
            .unwrap();
        registry
            .on_record(&crate::message::RecordMessage {
                stream: "orders".to_string(),
                record: json!({"id": 1}),
                time_extracted: None,
                version: None,
            })
            .unwrap();
        registry.seal("orders").unwrap().unwrap()
    }

    fn registry(dir: &TempDir) -> StreamRegistry {
        StreamRegistry::new(Arc::new(test_config()), dir.path().to_path_buf())
    }

    #[tokio::test]
    async fn state_waits_for_preceding_flush() {
        let warehouse = Arc::new(MockWarehouse::new());
        warehouse.delay_matching("COPY", Duration::from_millis(200));
        let (mut orchestrator, sink) = orchestrator(warehouse, test_config());
        let dir = TempDir::new().unwrap();
        let mut registry = registry(&dir);

        let item = flush_item(&mut registry);
        orchestrator.submit(item, 1).await;
        orchestrator.queue_state(json!({"a": 1}));

        // The COPY is still sleeping: nothing may be emitted yet.
        orchestrator.pump();
        assert!(sink.emitted().is_empty());

        let stats = orchestrator.finish().await.unwrap();
        assert_eq!(stats.batches_flushed, 1);
        assert_eq!(stats.states_emitted, 1);
        assert_eq!(sink.emitted(), vec![json!({"a": 1})]);
    }

    #[tokio::test]
    async fn state_with_no_outstanding_flush_is_emitted_immediately() {
        let warehouse = Arc::new(MockWarehouse::new());
        let (mut orchestrator, sink) = orchestrator(warehouse, test_config());

        orchestrator.queue_state(json!({"a": 1}));
        orchestrator.queue_state(json!({"a": 2}));
        assert_eq!(sink.emitted(), vec![json!({"a": 1}), json!({"a": 2})]);

        let stats = orchestrator.finish().await.unwrap();
        assert_eq!(stats.states_emitted, 2);
    }

    #[tokio::test]
    async fn states_sharing_a_flush_point_coalesce_to_the_latest() {
        let warehouse = Arc::new(MockWarehouse::new());
        warehouse.delay_matching("COPY", Duration::from_millis(100));
        let (mut orchestrator, sink) = orchestrator(warehouse, test_config());
        let dir = TempDir::new().unwrap();
        let mut registry = registry(&dir);

        let item = flush_item(&mut registry);
        orchestrator.submit(item, 1).await;
        orchestrator.queue_state(json!({"a": 1}));
        orchestrator.queue_state(json!({"a": 2}));

        let stats = orchestrator.finish().await.unwrap();
        assert_eq!(stats.states_emitted, 1);
        assert_eq!(sink.emitted(), vec![json!({"a": 2})]);
    }

    #[tokio::test]
    async fn states_are_emitted_in_capture_order() {
        let warehouse = Arc::new(MockWarehouse::new());
        warehouse.delay_matching("COPY", Duration::from_millis(50));
        let (mut orchestrator, sink) = orchestrator(warehouse, test_config());
        let dir = TempDir::new().unwrap();
        let mut registry = registry(&dir);

        let first = flush_item(&mut registry);
        orchestrator.submit(first, 1).await;
        orchestrator.queue_state(json!({"seq": 1}));

        let mut registry2 = registry_second(&dir);
        let second = flush_item(&mut registry2);
        orchestrator.submit(second, 1).await;
        orchestrator.queue_state(json!({"seq": 2}));

        orchestrator.finish().await.unwrap();
        assert_eq!(sink.emitted(), vec![json!({"seq": 1}), json!({"seq": 2})]);
    }

    fn registry_second(dir: &TempDir) -> StreamRegistry {
        StreamRegistry::new(Arc::new(test_config()), dir.path().to_path_buf())
    }

    #[tokio::test]
    async fn flush_failure_sets_the_abort_flag_and_withholds_states() {
        let warehouse = Arc::new(MockWarehouse::new());
        warehouse.fail_matching("COPY");
        let (mut orchestrator, sink) = orchestrator(warehouse, test_config());
        let dir = TempDir::new().unwrap();
        let mut registry = registry(&dir);

        let item = flush_item(&mut registry);
        orchestrator.submit(item, 1).await;
        orchestrator.queue_state(json!({"a": 1}));

        let err = orchestrator.finish().await.unwrap_err();
        assert!(matches!(err, TargetError::Sync { .. }));
        assert!(sink.emitted().is_empty());
    }

    #[tokio::test]
    async fn same_stream_flushes_serialize_on_the_stream_lock() {
        let warehouse = Arc::new(MockWarehouse::new());
        warehouse.delay_matching("COPY", Duration::from_millis(50));
        let mut config = test_config();
        config.parallelism = 4;
        let (mut orchestrator, _sink) = orchestrator(warehouse.clone(), config);
        let dir = TempDir::new().unwrap();
        let mut registry = registry(&dir);

        let first = flush_item(&mut registry);
        let lock = first.lock.clone();
        orchestrator.submit(first, 1).await;

        registry
            .on_record(&crate::message::RecordMessage {
                stream: "orders".to_string(),
                record: json!({"id": 2}),
                time_extracted: None,
                version: None,
            })
            .unwrap();
        let second = registry.seal("orders").unwrap().unwrap();
        assert!(Arc::ptr_eq(&lock, &second.lock));
        orchestrator.submit(second, 1).await;

        let stats = orchestrator.finish().await.unwrap();
        assert_eq!(stats.batches_flushed, 2);

        // Both loads ran; COPY statements never interleave because the
        // second worker waited on the stream lock.
        let copies: Vec<String> = warehouse
            .statements()
            .into_iter()
            .filter(|s| s.starts_with("COPY"))
            .collect();
        assert_eq!(copies.len(), 2);
    }

    #[test]
    fn pool_limit_modes() {
        let warehouse = Arc::new(MockWarehouse::new());

        let mut config = test_config();
        config.parallelism = 4;
        let (orchestrator, _) = orchestrator_for_limit(warehouse.clone(), config);
        assert_eq!(orchestrator.pool_limit(1), 4);

        let mut config = test_config();
        config.parallelism = 0;
        let (orchestrator, _) = orchestrator_for_limit(warehouse.clone(), config);
        assert_eq!(orchestrator.pool_limit(3), 3);
        assert_eq!(orchestrator.pool_limit(0), 1);

        let mut config = test_config();
        config.parallelism = 64;
        config.max_parallelism = 8;
        let (orchestrator, _) = orchestrator_for_limit(warehouse, config);
        assert_eq!(orchestrator.pool_limit(1), 8);
    }

    fn orchestrator_for_limit(
        warehouse: Arc<MockWarehouse>,
        config: crate::config::Config,
    ) -> (FlushOrchestrator, CollectingStateSink) {
        orchestrator(warehouse, config)
    }
}
