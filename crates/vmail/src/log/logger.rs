//! Metric logger trait and composites.

use std::collections::BTreeMap;

/// A destination for scalar metrics keyed by environment step.
pub trait MetricLogger: Send + Sync {
    fn log_scalar(&self, name: &str, value: f64, step: u64);

    /// Log a flushed set of metrics. Keys arrive sorted.
    fn log_metrics(&self, metrics: &BTreeMap<String, f64>, step: u64);

    /// Flush pending writes.
    fn close(&self) {}
}

/// Discards everything.
pub struct NoOpLogger;

impl MetricLogger for NoOpLogger {
    fn log_scalar(&self, _name: &str, _value: f64, _step: u64) {}
    fn log_metrics(&self, _metrics: &BTreeMap<String, f64>, _step: u64) {}
}

/// Dispatches to multiple backends in insertion order.
#[derive(Default)]
pub struct CompositeLogger {
    loggers: Vec<Box<dyn MetricLogger>>,
}

impl CompositeLogger {
    pub fn new(loggers: Vec<Box<dyn MetricLogger>>) -> Self {
        Self { loggers }
    }

    pub fn add(&mut self, logger: Box<dyn MetricLogger>) {
        self.loggers.push(logger);
    }

    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }
}

impl MetricLogger for CompositeLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        for logger in &self.loggers {
            logger.log_scalar(name, value, step);
        }
    }

    fn log_metrics(&self, metrics: &BTreeMap<String, f64>, step: u64) {
        for logger in &self.loggers {
            logger.log_metrics(metrics, step);
        }
    }

    fn close(&self) {
        for logger in &self.loggers {
            logger.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<(String, f64, u64)>>>);

    impl MetricLogger for Recorder {
        fn log_scalar(&self, name: &str, value: f64, step: u64) {
            self.0.lock().unwrap().push((name.to_string(), value, step));
        }

        fn log_metrics(&self, metrics: &BTreeMap<String, f64>, step: u64) {
            for (k, v) in metrics {
                self.log_scalar(k, *v, step);
            }
        }
    }

    #[test]
    fn test_composite_fans_out() {
        let a = Recorder::default();
        let b = Recorder::default();
        let mut composite = CompositeLogger::new(vec![Box::new(a.clone())]);
        composite.add(Box::new(b.clone()));
        composite.add(Box::new(NoOpLogger));
        assert_eq!(composite.len(), 3);

        let mut metrics = BTreeMap::new();
        metrics.insert("div".to_string(), 3.0);
        composite.log_metrics(&metrics, 10);
        composite.log_scalar("train/return", 1.5, 12);

        for r in [a, b] {
            let seen = r.0.lock().unwrap();
            assert_eq!(seen.len(), 2);
            assert_eq!(seen[1], ("train/return".to_string(), 1.5, 12));
        }
    }
}
