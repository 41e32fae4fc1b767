//! Telemetry error types.

use thiserror::Error;

/// Errors that can occur while setting up a metrics backend.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// No port near the requested one could be bound for the exporter.
    #[error("Failed to bind metrics exporter: {0}")]
    Bind(#[from] crate::proxy::NoFreePortError),

    /// The Prometheus exporter could not be installed.
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}
