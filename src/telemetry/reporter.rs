//! The reporting interface injected into the core.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Narrow metrics sink.
///
/// Names are the constants exported from [`crate::telemetry`]; labels are a
/// direction, a status or an operation name depending on the metric.
pub trait Reporter: Send + Sync {
    /// Add one to a counter.
    fn increment(&self, counter: &'static str, label: &str);

    /// Record a latency observation.
    fn observe(&self, histogram: &'static str, label: &str, elapsed: Duration);

    /// Set a sampled gauge.
    fn gauge(&self, name: &'static str, label: &str, value: f64);
}

/// Reporter that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn increment(&self, _counter: &'static str, _label: &str) {}

    fn observe(&self, _histogram: &'static str, _label: &str, _elapsed: Duration) {}

    fn gauge(&self, _name: &'static str, _label: &str, _value: f64) {}
}

type Key = (&'static str, String);

/// Reporter that keeps every value in memory.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    counters: Mutex<HashMap<Key, u64>>,
    observations: Mutex<HashMap<Key, Vec<Duration>>>,
    gauges: Mutex<HashMap<Key, f64>>,
}

impl MemoryReporter {
    /// Create an empty reporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter.
    pub fn counter(&self, name: &'static str, label: &str) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(name, label.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Number of observations recorded for a histogram.
    pub fn observation_count(&self, name: &'static str, label: &str) -> usize {
        self.observations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(name, label.to_string()))
            .map_or(0, Vec::len)
    }

    /// Last value set for a gauge.
    pub fn gauge_value(&self, name: &'static str, label: &str) -> Option<f64> {
        self.gauges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(name, label.to_string()))
            .copied()
    }
}

impl Reporter for MemoryReporter {
    fn increment(&self, counter: &'static str, label: &str) {
        *self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((counter, label.to_string()))
            .or_insert(0) += 1;
    }

    fn observe(&self, histogram: &'static str, label: &str, elapsed: Duration) {
        self.observations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((histogram, label.to_string()))
            .or_default()
            .push(elapsed);
    }

    fn gauge(&self, name: &'static str, label: &str, value: f64) {
        self.gauges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((name, label.to_string()), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_reporter_counts() {
        let reporter = MemoryReporter::new();
        reporter.increment("frames", "inbound");
        reporter.increment("frames", "inbound");
        reporter.increment("frames", "outbound");

        assert_eq!(reporter.counter("frames", "inbound"), 2);
        assert_eq!(reporter.counter("frames", "outbound"), 1);
        assert_eq!(reporter.counter("frames", "other"), 0);
    }

    #[test]
    fn test_memory_reporter_observations_and_gauges() {
        let reporter = MemoryReporter::new();
        reporter.observe("latency", "click", Duration::from_millis(3));
        reporter.gauge("depth", "inbound", 4.0);
        reporter.gauge("depth", "inbound", 2.0);

        assert_eq!(reporter.observation_count("latency", "click"), 1);
        assert_eq!(reporter.gauge_value("depth", "inbound"), Some(2.0));
        assert_eq!(reporter.gauge_value("depth", "outbound"), None);
    }

    #[test]
    fn test_null_reporter_is_object_safe() {
        let reporter: Box<dyn Reporter> = Box::new(NullReporter);
        reporter.increment("frames", "inbound");
        reporter.observe("latency", "navigate", Duration::ZERO);
        reporter.gauge("depth", "outbound", 1.0);
    }
}
