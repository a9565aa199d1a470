//! Metrics and observability infrastructure.
//!
//! Groups the internal event types and the optional Prometheus exporter.
//! The exporter is opt-in: stdin/stdout belong to the tap protocol, so
//! observability rides on a side-channel HTTP listener.

pub mod events;

use metrics_exporter_prometheus::PrometheusBuilder;
use snafu::prelude::*;
use std::net::SocketAddr;

use crate::error::{MetricsError, PrometheusInitSnafu};

/// Install the Prometheus recorder with an HTTP listener on `addr`.
pub fn init(addr: SocketAddr) -> Result<(), MetricsError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context(PrometheusInitSnafu)?;
    Ok(())
}

/// Emit an internal event as its metric.
///
/// # Example
///
/// ```ignore
/// use target_redshift::metrics::events::RecordsReceived;
///
/// emit!(RecordsReceived { count: 100 });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
