//! Process-scoped metrics recorder.
//!
//! One [`Metrics`] is created per process and handed to the supervisor and the
//! remediator as `Arc<Metrics>`. Every observation is kept in memory (so it can
//! be queried) and forwarded to the `metrics` facade, which an exporter may or
//! may not be listening on.

use std::collections::BTreeMap;
use std::sync::Mutex;

use metrics::Label;

type Key = (&'static str, String);

#[derive(Debug, Default)]
pub struct Metrics {
    counters: Mutex<BTreeMap<Key, u64>>,
    gauges: Mutex<BTreeMap<&'static str, f64>>,
}

fn render(labels: &[(&'static str, &str)]) -> String {
    labels.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",")
}

impl Metrics {
    pub fn new() -> Self { Self::default() }

    pub fn incr(&self, name: &'static str, labels: &[(&'static str, &str)]) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry((name, render(labels))).or_insert(0) += 1;
        }
        let labels: Vec<Label> = labels.iter().map(|(k, v)| Label::new(*k, v.to_string())).collect();
        metrics::counter!(name, 1u64, labels);
    }

    pub fn histogram_ms(&self, name: &'static str, ms: f64) {
        metrics::histogram!(name, ms);
    }

    pub fn gauge(&self, name: &'static str, value: f64) {
        if let Ok(mut gauges) = self.gauges.lock() {
            gauges.insert(name, value);
        }
        metrics::gauge!(name, value);
    }

    /// Current value of a counter; 0 when never incremented.
    pub fn counter(&self, name: &'static str, labels: &[(&'static str, &str)]) -> u64 {
        self.counters.lock().ok().and_then(|c| c.get(&(name, render(labels))).copied()).unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &'static str) -> Option<f64> {
        self.gauges.lock().ok().and_then(|g| g.get(name).copied())
    }

    // ---- typed observations ----

    pub fn record_operation(&self, operation: &str, status: &str) {
        self.incr("apply_operations_total", &[("operation", operation), ("status", status)]);
    }

    pub fn record_wait(&self, status: &str) {
        self.incr("wait_events_total", &[("status", status)]);
    }

    pub fn record_sync_error(&self, kind: &str) {
        self.incr("sync_errors_total", &[("type", kind)]);
    }

    pub fn record_resource_conflict(&self, kind: &str) {
        self.incr("resource_conflicts_total", &[("kind", kind)]);
    }

    pub fn record_remediation(&self, action: &str) {
        self.incr("remediations_total", &[("action", action)]);
    }

    pub fn record_retry(&self) {
        self.incr("remediator_retries_total", &[]);
    }

    pub fn observe_apply_duration(&self, ms: f64) { self.histogram_ms("apply_duration_ms", ms); }

    pub fn observe_remediate_duration(&self, ms: f64) { self.histogram_ms("remediate_duration_ms", ms); }

    pub fn set_queue_depth(&self, depth: usize) { self.gauge("remediator_queue_depth", depth as f64); }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_keyed_by_labels() {
        let m = Metrics::new();
        m.record_resource_conflict("Role");
        m.record_resource_conflict("Role");
        m.record_resource_conflict("ClusterRole");
        assert_eq!(m.counter("resource_conflicts_total", &[("kind", "Role")]), 2);
        assert_eq!(m.counter("resource_conflicts_total", &[("kind", "ClusterRole")]), 1);
        assert_eq!(m.counter("resource_conflicts_total", &[("kind", "Secret")]), 0);
        m.set_queue_depth(3);
        assert_eq!(m.gauge_value("remediator_queue_depth"), Some(3.0));
    }
}
