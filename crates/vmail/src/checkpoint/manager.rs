//! Single-file checkpoint with atomic replacement.

use super::state::{CheckpointMeta, Checkpointable};
use crate::{Result, VmailError};
use std::fs;
use std::path::{Path, PathBuf};
use tch::Tensor;

const STEP_KEY: &str = "meta/global_step";

/// Owns `{dir}/variables.ot` and its `{dir}/checkpoint.json` sidecar.
///
/// ```ignore
/// let manager = CheckpointManager::new(&config.logdir)?;
/// if let Some(step) = manager.load(&mut learner)? {
///     tracing::info!(step, "resumed");
/// }
/// manager.save(&learner, step)?;
/// ```
#[derive(Clone, Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join("variables.ot")
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("checkpoint.json")
    }

    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    /// Write all tensors plus the step to a temporary file, then rename it
    /// over the previous checkpoint.
    pub fn save<T: Checkpointable>(&self, component: &T, global_step: u64) -> Result<PathBuf> {
        let mut tensors = component.named_tensors();
        tensors.push((STEP_KEY.to_string(), Tensor::from(global_step as i64)));

        let path = self.path();
        let tmp = self.dir.join("variables.ot.tmp");
        Tensor::save_multi(tensors.as_slice(), &tmp)?;
        fs::rename(&tmp, &path)?;

        let meta = CheckpointMeta::new(global_step);
        let meta_tmp = self.dir.join("checkpoint.json.tmp");
        fs::write(&meta_tmp, serde_json::to_vec_pretty(&meta)?)?;
        fs::rename(&meta_tmp, self.meta_path())?;

        tracing::info!(
            path = %path.display(),
            global_step,
            tensors = tensors.len(),
            "saved checkpoint"
        );
        Ok(path)
    }

    /// Restore `component` if a checkpoint exists. Returns the stored step.
    pub fn load<T: Checkpointable>(&self, component: &mut T) -> Result<Option<u64>> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let tensors = Tensor::load_multi(&path)?;
        let step = read_step(&tensors)?;
        component.load_named_tensors(&tensors)?;
        tracing::info!(path = %path.display(), global_step = step, "loaded checkpoint");
        Ok(Some(step))
    }

    /// Metadata of the current checkpoint, if any.
    pub fn meta(&self) -> Result<Option<CheckpointMeta>> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok(None);
        }
        let meta = serde_json::from_slice(&fs::read(path)?)?;
        Ok(Some(meta))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn read_step(tensors: &[(String, Tensor)]) -> Result<u64> {
    tensors
        .iter()
        .find(|(name, _)| name == STEP_KEY)
        .map(|(_, t)| t.int64_value(&[]) as u64)
        .ok_or_else(|| VmailError::Checkpoint(format!("checkpoint has no {}", STEP_KEY)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};
    use tempfile::TempDir;

    struct Weights {
        w: Tensor,
    }

    impl Checkpointable for Weights {
        fn named_tensors(&self) -> Vec<(String, Tensor)> {
            vec![("w".to_string(), self.w.shallow_clone())]
        }

        fn load_named_tensors(&mut self, tensors: &[(String, Tensor)]) -> Result<()> {
            let (_, w) = tensors
                .iter()
                .find(|(n, _)| n == "w")
                .ok_or_else(|| VmailError::Checkpoint("missing w".into()))?;
            self.w = w.copy();
            Ok(())
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path()).unwrap();
        let source = Weights {
            w: Tensor::randn([3, 2], (Kind::Float, Device::Cpu)),
        };
        manager.save(&source, 500).unwrap();
        assert!(manager.exists());
        assert!(!dir.path().join("variables.ot.tmp").exists());

        let mut target = Weights {
            w: Tensor::zeros([3, 2], (Kind::Float, Device::Cpu)),
        };
        assert_eq!(manager.load(&mut target).unwrap(), Some(500));
        assert!(target.w.equal(&source.w));
        assert_eq!(manager.meta().unwrap().unwrap().global_step, 500);
    }

    #[test]
    fn test_load_without_checkpoint() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path()).unwrap();
        let mut target = Weights {
            w: Tensor::zeros([1], (Kind::Float, Device::Cpu)),
        };
        assert_eq!(manager.load(&mut target).unwrap(), None);
    }
}
