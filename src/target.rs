//! Main message loop.
//!
//! Reads tap messages from the input stream, dispatches them to the
//! stream registry, triggers flushes at batch boundaries, and shuts
//! down gracefully on SIGINT/SIGTERM: no new flushes are submitted,
//! in-flight flushes get a bounded grace period, the scratch directory
//! is swept, and the process exits non-zero.

use snafu::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ProtocolSnafu, ReadInputSnafu, SyncSnafu, TargetError, TargetStorageSnafu};
use crate::flush::{FlushOrchestrator, StateSink, StdoutStateSink};
use crate::message::{self, Message};
use crate::registry::StreamRegistry;
use crate::storage::StageStore;
use crate::sync::DbSync;
use crate::sync::client::{RedshiftWarehouse, Warehouse};

/// How long in-flight flushes may run after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Statistics about the target run.
#[derive(Debug, Clone, Default)]
pub struct TargetStats {
    pub streams: usize,
    pub records_received: u64,
    pub batches_flushed: u64,
    pub rows_loaded: u64,
    pub states_emitted: u64,
}

/// The streaming ingest engine: message loop plus its collaborators.
pub struct Target {
    config: Arc<Config>,
    db: Arc<DbSync>,
    registry: StreamRegistry,
    orchestrator: FlushOrchestrator,
    scratch_dir: PathBuf,
    shutdown: CancellationToken,
}

impl Target {
    /// Wire the engine against a warehouse, staging store and state
    /// sink. Production wiring lives in [`run_target`]; tests inject
    /// in-memory collaborators.
    pub fn new(
        config: Arc<Config>,
        warehouse: Arc<dyn Warehouse>,
        stage: StageStore,
        state_sink: Box<dyn StateSink>,
        shutdown: CancellationToken,
    ) -> Result<Self, TargetError> {
        let scratch_dir = config
            .scratch_root()
            .join(format!("target-redshift-{}", Uuid::new_v4().simple()));

        let db = Arc::new(DbSync::new(config.clone(), warehouse, stage).context(SyncSnafu)?);
        let registry = StreamRegistry::new(config.clone(), scratch_dir.clone());
        let orchestrator = FlushOrchestrator::new(db.clone(), config.clone(), state_sink);

        Ok(Self {
            config,
            db,
            registry,
            orchestrator,
            scratch_dir,
            shutdown,
        })
    }

    /// Consume the message stream until EOF, a failure, or a signal.
    /// The scratch directory is swept on every exit path.
    pub async fn run<R>(mut self, input: R) -> Result<TargetStats, TargetError>
    where
        R: AsyncBufRead + Unpin,
    {
        let loop_result = self.run_loop(input).await;

        // Clean EOF: everything still staged flushes now. Any other
        // exit leaves staged rows behind (no partial flush) and sweeps
        // them with the scratch directory.
        let mut final_flush_error = None;
        if matches!(loop_result, Ok(false)) && !self.orchestrator.has_failed() {
            for stream in self.registry.streams_with_rows() {
                match self.registry.seal(&stream) {
                    Ok(Some(item)) => {
                        let streams = self.registry.active_streams();
                        self.orchestrator.submit(item, streams).await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        final_flush_error = Some(e);
                        break;
                    }
                }
            }
        }

        let Target {
            orchestrator,
            registry,
            scratch_dir,
            ..
        } = self;

        let outcome = match (loop_result, final_flush_error) {
            (Ok(false), None) => orchestrator.finish().await.map(|flush_stats| TargetStats {
                streams: registry.active_streams(),
                records_received: registry.total_records(),
                batches_flushed: flush_stats.batches_flushed,
                rows_loaded: flush_stats.rows_loaded,
                states_emitted: flush_stats.states_emitted,
            }),
            (Ok(true), _) => {
                orchestrator.finish_within(SHUTDOWN_GRACE).await;
                Err(TargetError::Interrupted)
            }
            (Err(e), _) | (_, Some(e)) => {
                // Terminating on error: give in-flight flushes their
                // bounded grace, then report the original failure.
                orchestrator.finish_within(SHUTDOWN_GRACE).await;
                Err(e)
            }
        };

        sweep_scratch(&scratch_dir);
        outcome
    }

    /// The read-dispatch loop. Returns whether a shutdown signal ended
    /// it.
    async fn run_loop<R>(&mut self, input: R) -> Result<bool, TargetError>
    where
        R: AsyncBufRead + Unpin,
    {
        self.db.prepare().await.context(SyncSnafu)?;

        let mut lines = input.lines();
        let mut line_number: u64 = 0;

        loop {
            self.orchestrator.pump();
            // A failed flush stops the loop before any further
            // submission or read; the failure surfaces from finish().
            if self.orchestrator.has_failed() {
                return Ok(false);
            }

            let line = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested, stopping input");
                    return Ok(true);
                }

                line = lines.next_line() => line.context(ReadInputSnafu)?,
            };

            let Some(line) = line else {
                debug!("End of input after {line_number} lines");
                return Ok(false);
            };
            line_number += 1;
            if line.trim().is_empty() {
                continue;
            }

            match message::parse_line(&line, line_number).context(ProtocolSnafu)? {
                Message::Schema(msg) => {
                    if let Some(pending) = self.registry.on_schema(&msg)? {
                        let streams = self.registry.active_streams();
                        self.orchestrator.submit(pending, streams).await;
                    }
                }
                Message::Record(msg) => {
                    if self.registry.on_record(&msg)? {
                        self.flush(&msg.stream).await?;
                    }
                }
                Message::ActivateVersion(msg) => {
                    self.registry.on_activate_version(&msg)?;
                }
                Message::State(msg) => {
                    self.orchestrator.queue_state(msg.value);
                }
            }
        }
    }

    /// Flush one stream's batch, or every stream's when
    /// `flush_all_streams` is set.
    async fn flush(&mut self, stream: &str) -> Result<(), TargetError> {
        let streams = if self.config.flush_all_streams {
            self.registry.streams_with_rows()
        } else {
            vec![stream.to_string()]
        };

        for stream in streams {
            if let Some(item) = self.registry.seal(&stream)? {
                let active = self.registry.active_streams();
                self.orchestrator.submit(item, active).await;
            }
        }
        Ok(())
    }
}

/// Remove the per-run scratch directory. Runs on every exit path.
fn sweep_scratch(scratch_dir: &Path) {
    if !scratch_dir.exists() {
        return;
    }
    match std::fs::remove_dir_all(scratch_dir) {
        Ok(()) => debug!("Swept scratch directory {}", scratch_dir.display()),
        Err(e) => warn!(
            "Failed to sweep scratch directory {}: {}",
            scratch_dir.display(),
            e
        ),
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM on Unix).
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to set up SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to set up SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => {
            info!(message = "Signal received.", signal = "SIGINT");
        }
        _ = sigterm.recv() => {
            info!(message = "Signal received.", signal = "SIGTERM");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!(message = "Signal received.", signal = "ctrl-c");
    }
}

/// Run the target against stdin with production collaborators.
pub async fn run_target(config: Config) -> Result<TargetStats, TargetError> {
    let config = Arc::new(config);
    let shutdown = CancellationToken::new();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    // One connection per in-flight flush plus one for the loop's DDL.
    let max_connections = (config.max_parallelism + 1) as u32;
    let warehouse = Arc::new(
        RedshiftWarehouse::connect(&config, max_connections)
            .await
            .context(SyncSnafu)?,
    );
    let stage = StageStore::from_config(&config).context(TargetStorageSnafu)?;

    let target = Target::new(
        config,
        warehouse,
        stage,
        Box::new(StdoutStateSink),
        shutdown,
    )?;
    target.run(BufReader::new(tokio::io::stdin())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::testing::{CollectingStateSink, MockWarehouse};
    use object_store::memory::InMemory;

    fn target(config: Config) -> (Target, CollectingStateSink, PathBuf) {
        let mut config = config;
        config.aws_access_key_id = Some("AKIA_TEST".to_string());
        config.aws_secret_access_key = Some("SECRET_TEST".to_string());
        let warehouse = Arc::new(MockWarehouse::new());
        let stage = StageStore::new(Arc::new(InMemory::new()), "test-bucket");
        let sink = CollectingStateSink::default();
        let target = Target::new(
            Arc::new(config),
            warehouse,
            stage,
            Box::new(sink.clone()),
            CancellationToken::new(),
        )
        .unwrap();
        let scratch = target.scratch_dir.clone();
        (target, sink, scratch)
    }

    #[tokio::test]
    async fn empty_input_is_a_clean_run() {
        let (target, _sink, scratch) = target(test_config());
        let stats = target.run(&b""[..]).await.unwrap();
        assert_eq!(stats.records_received, 0);
        assert_eq!(stats.batches_flushed, 0);
        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn record_before_schema_aborts() {
        let (target, _sink, scratch) = target(test_config());
        let input = b"{\"type\":\"RECORD\",\"stream\":\"orders\",\"record\":{\"id\":1}}\n";
        let err = target.run(&input[..]).await.unwrap_err();
        assert!(matches!(err, TargetError::Protocol { .. }));
        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let (target, _sink, _) = target(test_config());
        let stats = target.run(&b"\n\n  \n"[..]).await.unwrap();
        assert_eq!(stats.records_received, 0);
    }
}
