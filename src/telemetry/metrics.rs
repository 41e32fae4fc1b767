//! `metrics` facade backend and the Prometheus exporter.

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

use super::error::TelemetryError;
use super::reporter::Reporter;
use crate::proxy::ports;

// Metric names shared by every backend.

/// Frames produced by proxy engines (counter, label: direction).
pub const PROXY_FRAMES_TOTAL: &str = "proxy_frames_total";
/// Frames dropped on a full queue (counter, label: direction).
pub const PROXY_FRAMES_DROPPED_TOTAL: &str = "proxy_frames_dropped_total";
/// Read-to-enqueue latency per frame (histogram, label: direction).
pub const PROXY_FRAME_LATENCY_SECONDS: &str = "proxy_frame_latency_seconds";
/// Accepted proxy connections (counter, label: `connect` or `http`).
pub const PROXY_CONNECTIONS_TOTAL: &str = "proxy_connections_total";
/// Sampled queue depth (gauge, label: direction).
pub const PROXY_QUEUE_DEPTH: &str = "proxy_queue_depth";
/// Finished automation commands (counter, label: `ok` or `error`).
pub const AUTOMATION_COMMANDS_TOTAL: &str = "automation_commands_total";
/// Automation command duration (histogram, label: operation).
pub const AUTOMATION_COMMAND_DURATION_SECONDS: &str = "automation_command_duration_seconds";
/// Sessions recreated after dying (counter, label: operation).
pub const AUTOMATION_SESSIONS_RECREATED_TOTAL: &str = "automation_sessions_recreated_total";

/// Reporter forwarding to whatever `metrics` recorder is installed.
///
/// With no recorder installed every call is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsReporter;

impl Reporter for MetricsReporter {
    fn increment(&self, counter: &'static str, label: &str) {
        ::metrics::counter!(counter, "label" => label.to_string()).increment(1);
    }

    fn observe(&self, histogram: &'static str, label: &str, elapsed: Duration) {
        ::metrics::histogram!(histogram, "label" => label.to_string()).record(elapsed.as_secs_f64());
    }

    fn gauge(&self, name: &'static str, label: &str, value: f64) {
        ::metrics::gauge!(name, "label" => label.to_string()).set(value);
    }
}

/// Install the global Prometheus recorder with an HTTP scrape endpoint.
///
/// If `addr`'s port is taken the next one is used. Returns the address
/// actually bound.
pub fn install_prometheus(addr: SocketAddr) -> Result<SocketAddr, TelemetryError> {
    let port = ports::allocate_on(addr.ip(), addr.port(), 2)?;
    let bound = SocketAddr::new(addr.ip(), port);

    PrometheusBuilder::new()
        .with_http_listener(bound)
        .install()
        .map_err(|e| TelemetryError::Install(e.to_string()))?;

    info!("Prometheus metrics exporter listening on {}", bound);
    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_reporter_records_into_local_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        ::metrics::with_local_recorder(&recorder, || {
            let reporter = MetricsReporter;
            reporter.increment(PROXY_FRAMES_TOTAL, "inbound");
            reporter.gauge(PROXY_QUEUE_DEPTH, "outbound", 3.0);
        });

        let output = handle.render();
        assert!(output.contains(PROXY_FRAMES_TOTAL));
        assert!(output.contains("inbound"));
        assert!(output.contains(PROXY_QUEUE_DEPTH));
    }

    #[test]
    fn test_metric_names_are_snake_case() {
        let names = [
            PROXY_FRAMES_TOTAL,
            PROXY_FRAMES_DROPPED_TOTAL,
            PROXY_FRAME_LATENCY_SECONDS,
            PROXY_CONNECTIONS_TOTAL,
            PROXY_QUEUE_DEPTH,
            AUTOMATION_COMMANDS_TOTAL,
            AUTOMATION_COMMAND_DURATION_SECONDS,
            AUTOMATION_SESSIONS_RECREATED_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "{} is not snake_case",
                name
            );
        }
    }
}
