use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Simple trait for metrics instrumentation
pub trait MetricsCollector: Send + Sync {
    fn inc_counter(&self, name: &str);
    fn observe_gauge(&self, name: &str, value: f64);
}

/// Discards everything. Used when no collector is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsCollector for NoopMetrics {
    fn inc_counter(&self, _name: &str) {}
    fn observe_gauge(&self, _name: &str, _value: f64) {}
}

/// Keeps counters and the latest gauge values in memory, mostly for tests.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, f64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, 0 if it was never incremented
    pub fn counter(&self, name: &str) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.get(name).copied().unwrap_or(0)
    }

    /// Last observed value of a gauge
    pub fn gauge(&self, name: &str) -> Option<f64> {
        let gauges = self.gauges.lock().unwrap_or_else(PoisonError::into_inner);
        gauges.get(name).copied()
    }
}

impl MetricsCollector for InMemoryMetrics {
    fn inc_counter(&self, name: &str) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        *counters.entry(name.to_string()).or_insert(0) += 1;
    }

    fn observe_gauge(&self, name: &str, value: f64) {
        let mut gauges = self.gauges.lock().unwrap_or_else(PoisonError::into_inner);
        gauges.insert(name.to_string(), value);
    }
}
