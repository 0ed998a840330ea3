//! Console logging backend.

use super::MetricLogger;
use std::collections::BTreeMap;

/// Prints one `[step] name value / ...` line per flush through tracing.
#[derive(Default)]
pub struct ConsoleLogger;

impl ConsoleLogger {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn format_metrics(metrics: &BTreeMap<String, f64>, step: u64) -> String {
    let body = metrics
        .iter()
        .map(|(k, v)| format!("{} {:.1}", k, v))
        .collect::<Vec<_>>()
        .join(" / ");
    format!("[{}] {}", step, body)
}

impl MetricLogger for ConsoleLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        tracing::info!("[{}] {} {:.1}", step, name, value);
    }

    fn log_metrics(&self, metrics: &BTreeMap<String, f64>, step: u64) {
        if metrics.is_empty() {
            return;
        }
        tracing::info!("{}", format_metrics(metrics, step));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_is_sorted() {
        let mut metrics = BTreeMap::new();
        metrics.insert("value_loss".to_string(), 0.25);
        metrics.insert("div".to_string(), 3.0);
        assert_eq!(format_metrics(&metrics, 40), "[40] div 3.0 / value_loss 0.2");
    }
}
