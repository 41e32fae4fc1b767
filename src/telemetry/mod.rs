//! Metrics reporting for the proxy and the worker pool.
//!
//! The core never talks to a metrics backend directly. Components receive an
//! `Arc<dyn Reporter>` at construction and report counters, latencies and
//! sampled gauges through it.
//!
//! # Backends
//!
//! - [`NullReporter`]: discards everything
//! - [`MemoryReporter`]: keeps values in memory, for tests and status readouts
//! - [`MetricsReporter`]: forwards to the `metrics` facade; the binary installs
//!   a Prometheus exporter behind it with [`install_prometheus`]
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use tankbot::telemetry::{self, MetricsReporter, Reporter};
//!
//! telemetry::install_prometheus("127.0.0.1:9898".parse()?)?;
//! let reporter: Arc<dyn Reporter> = Arc::new(MetricsReporter);
//! reporter.increment(telemetry::PROXY_FRAMES_TOTAL, "inbound");
//! ```

mod error;
mod metrics;
mod reporter;

pub use error::TelemetryError;
pub use metrics::{
    AUTOMATION_COMMAND_DURATION_SECONDS, AUTOMATION_COMMANDS_TOTAL,
    AUTOMATION_SESSIONS_RECREATED_TOTAL, MetricsReporter, PROXY_CONNECTIONS_TOTAL,
    PROXY_FRAME_LATENCY_SECONDS, PROXY_FRAMES_DROPPED_TOTAL, PROXY_FRAMES_TOTAL,
    PROXY_QUEUE_DEPTH, install_prometheus,
};
pub use reporter::{MemoryReporter, NullReporter, Reporter};
