//! Scripted expert for recording demonstrations.

use crate::point_reach::PointReach;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use vmail::data::Episode;
use vmail::env::{Collect, Environment, EpisodeSink, TimeLimit};
use vmail::{Result, VmailError};

/// Proportional-derivative controller that steers the point onto the target.
#[derive(Clone, Debug)]
pub struct ScriptedExpert {
    kp: f32,
    kd: f32,
    noise: Option<Normal<f32>>,
    rng: StdRng,
}

impl ScriptedExpert {
    pub fn new(seed: u64) -> Self {
        Self {
            kp: 0.5,
            kd: 0.5,
            noise: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Perturb every action with Gaussian noise so demonstrations cover
    /// states slightly off the optimal path.
    pub fn with_noise(mut self, std: f32) -> Result<Self> {
        let normal = Normal::new(0.0, std)
            .map_err(|e| VmailError::Config(format!("invalid expert noise {}: {}", std, e)))?;
        self.noise = Some(normal);
        Ok(self)
    }

    pub fn act(&mut self, env: &PointReach) -> [f32; 2] {
        let position = env.position();
        let velocity = env.velocity();
        let target = env.target();
        let mut action = [0.0; 2];
        for i in 0..2 {
            let mut a = self.kp * (target[i] - position[i]) - self.kd * velocity[i];
            if let Some(noise) = &self.noise {
                a += noise.sample(&mut self.rng);
            }
            action[i] = a.clamp(-1.0, 1.0);
        }
        action
    }
}

/// Run the expert for `episodes` episodes of at most `time_limit` steps and
/// store each one under `dir`. Returns the written files.
pub fn record_demonstrations(
    env: PointReach,
    expert: &mut ScriptedExpert,
    episodes: usize,
    time_limit: u64,
    dir: impl AsRef<Path>,
) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref().to_path_buf();
    let written = Arc::new(Mutex::new(Vec::new()));
    let sink_written = Arc::clone(&written);
    let sink: EpisodeSink = Box::new(move |episode: &Episode| {
        let path = episode.save(&dir)?;
        sink_written
            .lock()
            .map_err(|_| VmailError::Data("demonstration list poisoned".into()))?
            .push(path);
        Ok(())
    });

    let mut env = Collect::new(TimeLimit::new(env, time_limit), vec![sink]);
    for _ in 0..episodes {
        env.reset()?;
        loop {
            let action = expert.act(env.inner().inner());
            if env.step(&action)?.done {
                break;
            }
        }
    }
    drop(env);

    let written = written
        .lock()
        .map_err(|_| VmailError::Data("demonstration list poisoned".into()))?
        .clone();
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmail::data::{count_episodes, episode_length};

    #[test]
    fn test_expert_reaches_target() {
        let mut env = PointReach::new(5);
        let mut expert = ScriptedExpert::new(0);
        env.reset().unwrap();
        let mut reached = false;
        for _ in 0..200 {
            let action = expert.act(&env);
            if env.step(&action).unwrap().done {
                reached = true;
                break;
            }
        }
        assert!(reached, "expert stuck at distance {}", env.distance());
    }

    #[test]
    fn test_expert_beats_idle_return() {
        let mut env = PointReach::new(9);
        let mut expert = ScriptedExpert::new(0);
        env.reset().unwrap();
        let start = env.distance();
        for _ in 0..5 {
            let action = expert.act(&env);
            env.step(&action).unwrap();
        }
        assert!(env.distance() < start);
    }

    #[test]
    fn test_record_demonstrations() {
        let dir = tempfile::tempdir().unwrap();
        let mut expert = ScriptedExpert::new(1).with_noise(0.1).unwrap();
        let files =
            record_demonstrations(PointReach::new(2), &mut expert, 3, 50, dir.path()).unwrap();
        assert_eq!(files.len(), 3);
        for file in &files {
            let length = episode_length(file).unwrap();
            assert!((2..=51).contains(&length), "length {}", length);
        }
        let (count, _) = count_episodes(dir.path()).unwrap();
        assert_eq!(count, 3);
    }
}
