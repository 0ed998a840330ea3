//! Episodes on disk: one libtorch archive per episode.

use crate::env::Observation;
use crate::{Result, VmailError};
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};
use tch::{Kind, Tensor};

const EXTENSION: &str = "ot";

/// One environment transition in the order it is stored.
#[derive(Clone, Debug)]
pub struct Transition {
    pub observation: Observation,
    /// Action that led to `observation`; zeros for the first transition
    pub action: Vec<f32>,
    pub reward: f32,
    pub discount: f32,
}

/// A complete episode as time-major tensors.
#[derive(Debug)]
pub struct Episode {
    /// `u8 [T, H, W, 3]`
    pub image: Tensor,
    /// `f32 [T, H, W, 1]`
    pub depth: Option<Tensor>,
    /// `f32 [T, P]`
    pub proprio: Option<Tensor>,
    /// `f32 [T, A]`
    pub action: Tensor,
    /// `f32 [T]`
    pub reward: Tensor,
    /// `f32 [T]`; absent from some demonstration sets
    pub discount: Option<Tensor>,
}

impl Clone for Episode {
    fn clone(&self) -> Self {
        self.map(Tensor::shallow_clone)
    }
}

impl Episode {
    fn map(&self, f: impl Fn(&Tensor) -> Tensor) -> Self {
        Self {
            image: f(&self.image),
            depth: self.depth.as_ref().map(&f),
            proprio: self.proprio.as_ref().map(&f),
            action: f(&self.action),
            reward: f(&self.reward),
            discount: self.discount.as_ref().map(&f),
        }
    }

    /// Stack recorded transitions. Optional fields are kept only when every
    /// observation carries them.
    pub fn from_transitions(transitions: &[Transition]) -> Result<Self> {
        let first = transitions
            .first()
            .ok_or_else(|| VmailError::Data("cannot build an empty episode".into()))?;
        let steps = transitions.len() as i64;
        let image_shape: Vec<i64> = first
            .observation
            .image
            .shape()
            .iter()
            .map(|&d| d as i64)
            .collect();

        let pixels: Vec<u8> = transitions
            .iter()
            .flat_map(|t| t.observation.image.iter().copied())
            .collect();
        let image = Tensor::from_slice(&pixels).view([
            steps,
            image_shape[0],
            image_shape[1],
            image_shape[2],
        ]);

        let depth = if transitions.iter().all(|t| t.observation.depth.is_some()) {
            let values: Vec<f32> = transitions
                .iter()
                .flat_map(|t| t.observation.depth.iter().flat_map(|d| d.iter().copied()))
                .collect();
            Some(Tensor::from_slice(&values).view([steps, image_shape[0], image_shape[1], 1]))
        } else {
            None
        };

        let proprio = if transitions.iter().all(|t| t.observation.proprio.is_some()) {
            let values: Vec<f32> = transitions
                .iter()
                .flat_map(|t| t.observation.proprio.iter().flat_map(|p| p.iter().copied()))
                .collect();
            Some(Tensor::from_slice(&values).view([steps, -1]))
        } else {
            None
        };

        let actions: Vec<f32> = transitions.iter().flat_map(|t| t.action.iter().copied()).collect();
        let action = Tensor::from_slice(&actions).view([steps, first.action.len() as i64]);
        let rewards: Vec<f32> = transitions.iter().map(|t| t.reward).collect();
        let discounts: Vec<f32> = transitions.iter().map(|t| t.discount).collect();

        Ok(Self {
            image,
            depth,
            proprio,
            action,
            reward: Tensor::from_slice(&rewards),
            discount: Some(Tensor::from_slice(&discounts)),
        })
    }

    /// Number of stored transitions, including the initial observation.
    pub fn len(&self) -> i64 {
        self.reward.size()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_reward(&self) -> f64 {
        self.reward.sum(Kind::Double).double_value(&[])
    }

    /// `length` consecutive transitions starting at `start`.
    pub fn slice(&self, start: i64, length: i64) -> Self {
        self.map(|t| t.narrow(0, start, length))
    }

    fn named(&self) -> Vec<(&'static str, Tensor)> {
        let mut named = vec![
            ("image", self.image.shallow_clone()),
            ("action", self.action.shallow_clone()),
            ("reward", self.reward.shallow_clone()),
        ];
        for (name, tensor) in [
            ("depth", &self.depth),
            ("proprio", &self.proprio),
            ("discount", &self.discount),
        ] {
            if let Some(t) = tensor {
                named.push((name, t.shallow_clone()));
            }
        }
        named
    }

    /// Write to `{dir}/{timestamp}-{id}-{length}.ot`.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let id: u32 = rand::thread_rng().gen();
        let path = dir.join(format!(
            "{}-{:08x}-{}.{}",
            timestamp,
            id,
            self.len(),
            EXTENSION
        ));
        let named = self.named();
        Tensor::save_multi(named.as_slice(), &path)?;
        Ok(path)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut tensors = Tensor::load_multi(path)?;
        let mut take = |name: &str| {
            tensors
                .iter()
                .position(|(n, _)| n == name)
                .map(|i| tensors.swap_remove(i).1)
        };
        let missing = |name: &str| {
            VmailError::Data(format!("{} has no '{}' tensor", path.display(), name))
        };
        Ok(Self {
            image: take("image").ok_or_else(|| missing("image"))?,
            action: take("action").ok_or_else(|| missing("action"))?,
            reward: take("reward").ok_or_else(|| missing("reward"))?,
            depth: take("depth"),
            proprio: take("proprio"),
            discount: take("discount"),
        })
    }
}

/// Episode archives in `dir`, sorted by name (oldest first).
pub fn list_episodes(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(EXTENSION))
        .collect();
    paths.sort();
    Ok(paths)
}

/// Length encoded in an episode file name.
pub fn episode_length(path: &Path) -> Option<u64> {
    path.file_stem()?.to_str()?.rsplit('-').next()?.parse().ok()
}

/// `(episodes, transitions)` in `dir`, where each episode contributes
/// `length - 1` transitions.
pub fn count_episodes(dir: impl AsRef<Path>) -> Result<(usize, u64)> {
    let lengths: Vec<u64> = list_episodes(dir)?
        .iter()
        .filter_map(|p| episode_length(p))
        .collect();
    let steps = lengths.iter().map(|l| l.saturating_sub(1)).sum();
    Ok((lengths.len(), steps))
}

/// Environment steps represented by the episodes in `dir`.
pub fn count_steps(dir: impl AsRef<Path>, action_repeat: u64) -> Result<u64> {
    Ok(count_episodes(dir)?.1 * action_repeat)
}

/// Copy every episode from `src` into `dst`, skipping names already present.
pub fn copy_episodes(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<usize> {
    let dst = dst.as_ref();
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    for path in list_episodes(src)? {
        let Some(name) = path.file_name() else {
            continue;
        };
        let target = dst.join(name);
        if !target.exists() {
            fs::copy(&path, &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}
