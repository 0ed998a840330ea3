//! Checkpoint trait and the on-disk metadata record.

use crate::Result;
use serde::{Deserialize, Serialize};
use tch::Tensor;

/// Components that can be saved to and restored from named tensors.
///
/// Names are stable identifiers such as `"model/params/rssm.cell.weight_ih"`;
/// a restore must find every name it expects or fail.
pub trait Checkpointable {
    /// Snapshot of every tensor needed to resume.
    fn named_tensors(&self) -> Vec<(String, Tensor)>;

    /// Copy tensors back in place.
    fn load_named_tensors(&mut self, tensors: &[(String, Tensor)]) -> Result<()>;
}

/// Bookkeeping stored next to the tensors.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CheckpointMeta {
    /// Environment steps taken when the checkpoint was written
    pub global_step: u64,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
    pub version: String,
}

impl CheckpointMeta {
    pub fn new(global_step: u64) -> Self {
        Self {
            global_step,
            timestamp: unix_timestamp(),
            version: crate::VERSION.to_string(),
        }
    }
}

fn unix_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_serialization() {
        let meta = CheckpointMeta::new(1200);
        let json = serde_json::to_string(&meta).unwrap();
        let back: CheckpointMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
        assert_eq!(back.version, crate::VERSION);
    }
}
