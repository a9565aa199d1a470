//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the target.
//! Events implement the `InternalEvent` trait which emits the
//! corresponding Prometheus metric.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when records are received from the tap.
pub struct RecordsReceived {
    pub count: u64,
}

impl InternalEvent for RecordsReceived {
    fn emit(self) {
        trace!(count = self.count, "Records received");
        counter!("target_redshift_records_received_total").increment(self.count);
    }
}

/// Event emitted when a batch is sealed into stage files.
pub struct BytesStaged {
    pub bytes: u64,
}

impl InternalEvent for BytesStaged {
    fn emit(self) {
        trace!(bytes = self.bytes, "Bytes staged");
        counter!("target_redshift_bytes_staged_total").increment(self.bytes);
    }
}

/// Event emitted when a batch finishes loading into the warehouse.
pub struct BatchLoaded {
    pub rows: u64,
    pub duration: Duration,
}

impl InternalEvent for BatchLoaded {
    fn emit(self) {
        trace!(rows = self.rows, "Batch loaded");
        counter!("target_redshift_batches_loaded_total").increment(1);
        counter!("target_redshift_rows_loaded_total").increment(self.rows);
        histogram!("target_redshift_batch_load_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a STATE checkpoint is echoed on stdout.
pub struct StateEmitted;

impl InternalEvent for StateEmitted {
    fn emit(self) {
        trace!("State emitted");
        counter!("target_redshift_states_emitted_total").increment(1);
    }
}

/// Gauge of currently running flush workers.
pub struct ActiveFlushes {
    pub count: usize,
}

impl InternalEvent for ActiveFlushes {
    fn emit(self) {
        gauge!("target_redshift_active_flushes").set(self.count as f64);
    }
}

/// Object-store operation kinds.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Put,
    Delete,
}

impl StorageOperation {
    fn as_str(self) -> &'static str {
        match self {
            StorageOperation::Put => "put",
            StorageOperation::Delete => "delete",
        }
    }
}

/// Status of an object-store request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted for each staging object-store request.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "target_redshift_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}
