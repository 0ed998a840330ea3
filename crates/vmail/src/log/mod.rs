//! Metric sinks.
//!
//! - `MetricLogger`: trait every backend implements
//! - `ConsoleLogger`: one tracing line per flush
//! - `JsonlLogger`: append-only `metrics.jsonl`
//! - `TensorBoardLogger`: event files (feature `tensorboard`)
//! - `CompositeLogger`: fan-out to several backends

mod console;
mod jsonl;
mod logger;
#[cfg(feature = "tensorboard")]
mod tensorboard;

pub use console::ConsoleLogger;
pub use jsonl::JsonlLogger;
pub use logger::{CompositeLogger, MetricLogger, NoOpLogger};
#[cfg(feature = "tensorboard")]
pub use tensorboard::TensorBoardLogger;
