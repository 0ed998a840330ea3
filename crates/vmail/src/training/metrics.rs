//! Running-mean metrics and the per-step training context.

use std::collections::BTreeMap;

/// Map from metric name to a running mean, cleared on flush.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    values: BTreeMap<String, (f64, u64)>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, name: &str, value: f64) {
        let entry = self.values.entry(name.to_string()).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }

    pub fn mean(&self, name: &str) -> Option<f64> {
        self.values
            .get(name)
            .filter(|(_, n)| *n > 0)
            .map(|(sum, n)| sum / *n as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Current means, sorted by name.
    pub fn result(&self) -> BTreeMap<String, f64> {
        self.values
            .iter()
            .filter(|(_, (_, n))| *n > 0)
            .map(|(k, (sum, n))| (k.clone(), sum / *n as f64))
            .collect()
    }

    /// Return current means and reset every accumulator.
    pub fn flush(&mut self) -> BTreeMap<String, f64> {
        let result = self.result();
        self.values.clear();
        result
    }
}

/// Mutable state threaded through every training and interaction call.
#[derive(Clone, Debug, Default)]
pub struct TrainContext {
    /// Global environment step counter
    pub step: u64,
    pub metrics: Metrics,
}

impl TrainContext {
    pub fn new(step: u64) -> Self {
        Self {
            step,
            metrics: Metrics::new(),
        }
    }
}
