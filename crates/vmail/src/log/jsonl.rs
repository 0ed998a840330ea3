//! Append-only `metrics.jsonl` backend.

use super::MetricLogger;
use crate::Result;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Writes one JSON object per flush: `{"step": n, "name": value, ...}`.
pub struct JsonlLogger {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlLogger {
    /// Open `{logdir}/metrics.jsonl` for appending.
    pub fn new(logdir: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(logdir.as_ref())?;
        let path = logdir.as_ref().join("metrics.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&self, record: Map<String, Value>) {
        let line = Value::Object(record).to_string();
        let Ok(mut file) = self.file.lock() else {
            return;
        };
        if let Err(e) = writeln!(file, "{}", line) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to append metrics");
        }
    }
}

fn record(step: u64) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("step".to_string(), Value::from(step));
    map
}

impl MetricLogger for JsonlLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        let mut map = record(step);
        map.insert(name.to_string(), Value::from(value));
        self.write_line(map);
    }

    fn log_metrics(&self, metrics: &BTreeMap<String, f64>, step: u64) {
        let mut map = record(step);
        for (k, v) in metrics {
            map.insert(k.clone(), Value::from(*v));
        }
        self.write_line(map);
    }

    fn close(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}
