//! Metrics sink injected into each component.
//!
//! Components receive an `Arc<dyn MetricsSink>` at construction; there are
//! no process-wide counters.

use tracing::debug;

pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &'static str, labels: &[(&'static str, &str)]);

    fn observe(&self, name: &'static str, value: f64, labels: &[(&'static str, &str)]);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &'static str, _labels: &[(&'static str, &str)]) {}

    fn observe(&self, _name: &'static str, _value: f64, _labels: &[(&'static str, &str)]) {}
}

/// Emits each measurement as a `tracing` debug event under the `cmp::metrics`
/// target, for collection by whatever subscriber the host installs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment(&self, name: &'static str, labels: &[(&'static str, &str)]) {
        debug!(target: "cmp::metrics", metric = name, ?labels, "counter");
    }

    fn observe(&self, name: &'static str, value: f64, labels: &[(&'static str, &str)]) {
        debug!(target: "cmp::metrics", metric = name, value, ?labels, "observation");
    }
}
