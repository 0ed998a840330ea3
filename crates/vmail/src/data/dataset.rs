//! Replay sampling of fixed-length sequences from an episode directory.

use super::episode::{list_episodes, Episode};
use crate::config::VmailConfig;
use crate::{Result, VmailError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tch::{Device, Kind, Tensor};

/// A preprocessed training batch, batch-major `[B, T, ..]`.
#[derive(Debug)]
pub struct Batch {
    /// `[B, T, H, W, C]` in `[-0.5, 0.5]`; depth stacked as a fourth channel
    pub image: Tensor,
    pub proprio: Option<Tensor>,
    pub action: Tensor,
    pub reward: Option<Tensor>,
    pub discount: Option<Tensor>,
}

/// Scale pixels to `[-0.5, 0.5]`, recentre depth by `-0.5` and stack it as
/// an extra channel.
pub fn preprocess_image(image: &Tensor, depth: Option<&Tensor>) -> Tensor {
    let image = image.to_kind(Kind::Float) / 255.0 - 0.5;
    match depth {
        Some(depth) => Tensor::cat(&[image, depth.to_kind(Kind::Float) - 0.5], -1),
        None => image,
    }
}

/// Stack episode slices and apply observation preprocessing.
pub fn collate(slices: &[Episode], config: &VmailConfig) -> Result<Batch> {
    let stack = |f: &dyn Fn(&Episode) -> Option<Tensor>| -> Option<Tensor> {
        let parts: Option<Vec<Tensor>> = slices.iter().map(f).collect();
        parts.map(|p| Tensor::stack(&p, 0).to_device(config.device))
    };
    let image = stack(&|e| Some(e.image.shallow_clone()))
        .ok_or_else(|| VmailError::Data("empty batch".into()))?;
    let depth = if config.use_depth_obs {
        Some(stack(&|e| e.depth.as_ref().map(Tensor::shallow_clone)).ok_or_else(|| {
            VmailError::Data("use_depth_obs is set but episodes have no depth".into())
        })?)
    } else {
        None
    };
    let proprio = if config.use_proprio_obs {
        stack(&|e| e.proprio.as_ref().map(Tensor::shallow_clone))
            .map(|p| p.to_kind(Kind::Float))
    } else {
        None
    };
    let action = stack(&|e| Some(e.action.shallow_clone()))
        .ok_or_else(|| VmailError::Data("empty batch".into()))?
        .to_kind(Kind::Float);
    let reward = stack(&|e| Some(e.reward.shallow_clone()))
        .map(|r| config.clip_rewards.apply(&r.to_kind(Kind::Float)));
    let discount =
        stack(&|e| e.discount.as_ref().map(Tensor::shallow_clone)).map(|d| d.to_kind(Kind::Float));

    Ok(Batch {
        image: preprocess_image(&image, depth.as_ref()),
        proprio,
        action,
        reward,
        discount,
    })
}

/// Episodes of one directory, cached in memory and rescanned on every batch.
pub struct EpisodeDataset {
    dir: PathBuf,
    episodes: BTreeMap<PathBuf, Episode>,
    rng: StdRng,
    length: i64,
    balance: bool,
}

impl EpisodeDataset {
    pub fn new(dir: impl Into<PathBuf>, length: i64, balance: bool, seed: u64) -> Self {
        Self {
            dir: dir.into(),
            episodes: BTreeMap::new(),
            rng: StdRng::seed_from_u64(seed),
            length,
            balance,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load episodes written since the last scan. Returns how many are new.
    pub fn refresh(&mut self) -> Result<usize> {
        let mut added = 0;
        for path in list_episodes(&self.dir)? {
            if self.episodes.contains_key(&path) {
                continue;
            }
            match Episode::load(&path) {
                Ok(episode) => {
                    self.episodes.insert(path, episode);
                    added += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "skipping unreadable episode"
                    )
                }
            }
        }
        Ok(added)
    }

    pub fn len(&self) -> usize {
        self.episodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty()
    }

    /// A random `length`-step slice of a random episode long enough to hold
    /// one. With `balance`, starts are drawn over the whole episode and
    /// clamped so late starts are not under-sampled.
    pub fn sample_slice(&mut self) -> Result<Episode> {
        let eligible: Vec<&Episode> = self
            .episodes
            .values()
            .filter(|e| e.len() > self.length)
            .collect();
        if eligible.is_empty() {
            return Err(VmailError::Data(format!(
                "no episode in {} is longer than {} steps",
                self.dir.display(),
                self.length
            )));
        }
        let episode = eligible[self.rng.gen_range(0..eligible.len())];
        let available = episode.len() - self.length;
        let start = if self.balance {
            self.rng.gen_range(0..=episode.len()).min(available)
        } else {
            self.rng.gen_range(0..=available)
        };
        Ok(episode.slice(start, self.length))
    }

    /// Sample `batch_size` slices, preprocessed and on `config.device`.
    pub fn sample_batch(&mut self, config: &VmailConfig) -> Result<Batch> {
        self.refresh()?;
        let slices = (0..config.batch_size)
            .map(|_| self.sample_slice())
            .collect::<Result<Vec<_>>>()?;
        collate(&slices, config)
    }
}

/// Prepare single observations for the policy: `[B, H, W, C]` images and
/// `[B, P]` proprioception.
pub fn observation_batch(
    observations: &[crate::env::Observation],
    config: &VmailConfig,
    device: Device,
) -> Result<(Tensor, Option<Tensor>)> {
    let transitions: Vec<super::Transition> = observations
        .iter()
        .map(|o| super::Transition {
            observation: o.clone(),
            action: Vec::new(),
            reward: 0.0,
            discount: 1.0,
        })
        .collect();
    let stacked = Episode::from_transitions(&transitions)?;
    let depth = if config.use_depth_obs {
        Some(stacked.depth.ok_or_else(|| {
            VmailError::Data("use_depth_obs is set but observation has no depth".into())
        })?)
    } else {
        None
    };
    let image = preprocess_image(&stacked.image, depth.as_ref()).to_device(device);
    let proprio = if config.use_proprio_obs {
        stacked.proprio.map(|p| p.to_device(device))
    } else {
        None
    };
    Ok((image, proprio))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Transition;
    use crate::env::Observation;
    use ndarray::{Array1, Array3};
    use tempfile::TempDir;

    fn write_episode(dir: &Path, length: usize) {
        let transitions: Vec<Transition> = (0..length)
            .map(|i| Transition {
                observation: Observation::new(Array3::from_elem((64, 64, 3), 255))
                    .with_proprio(Array1::zeros(4)),
                action: vec![0.5, -0.5],
                reward: i as f32,
                discount: 1.0,
            })
            .collect();
        Episode::from_transitions(&transitions)
            .unwrap()
            .save(dir)
            .unwrap();
    }

    #[test]
    fn test_sample_batch_shapes_and_scaling() {
        let dir = TempDir::new().unwrap();
        write_episode(dir.path(), 12);
        let config = VmailConfig::default().with_batch(3, 5);
        let mut dataset = EpisodeDataset::new(dir.path(), 5, false, 0);

        let batch = dataset.sample_batch(&config).unwrap();
        assert_eq!(dataset.len(), 1);
        assert_eq!(batch.image.size(), vec![3, 5, 64, 64, 3]);
        assert_eq!(batch.proprio.as_ref().unwrap().size(), vec![3, 5, 4]);
        assert_eq!(batch.action.size(), vec![3, 5, 2]);
        assert!((batch.image.max().double_value(&[]) - 0.5).abs() < 1e-6);

        // consecutive rewards prove slices are contiguous
        let reward = batch.reward.unwrap();
        let diff = reward.narrow(1, 1, 4) - reward.narrow(1, 0, 4);
        assert!(diff.allclose(&diff.ones_like(), 1e-6, 1e-6, false));
    }

    #[test]
    fn test_short_episodes_are_skipped() {
        let dir = TempDir::new().unwrap();
        write_episode(dir.path(), 5);
        let config = VmailConfig::default().with_batch(2, 5);
        let mut dataset = EpisodeDataset::new(dir.path(), 5, true, 0);
        assert!(dataset.sample_batch(&config).is_err());

        write_episode(dir.path(), 8);
        let batch = dataset.sample_batch(&config).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(batch.action.size()[1], 5);
    }

    #[test]
    fn test_tanh_clipping_and_depth() {
        let reward = Tensor::from_slice(&[10.0f32]);
        let clipped = crate::config::ClipRewards::Tanh.apply(&reward);
        assert!(clipped.double_value(&[0]) <= 1.0);

        let image = Tensor::zeros([1, 2, 2, 3], (Kind::Uint8, Device::Cpu));
        let depth = Tensor::ones([1, 2, 2, 1], (Kind::Float, Device::Cpu));
        let stacked = preprocess_image(&image, Some(&depth));
        assert_eq!(stacked.size(), vec![1, 2, 2, 4]);
        assert_eq!(stacked.double_value(&[0, 0, 0, 0]), -0.5);
        assert_eq!(stacked.double_value(&[0, 0, 0, 3]), 0.5);
    }
}
