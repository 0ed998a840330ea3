//! Environment wrappers for common functionality.

use super::{Environment, Observation, StepResult};
use crate::data::{Episode, Transition};
use crate::spaces::{Box as BoxSpace, DynSpace};
use crate::{Result, VmailError};

/// Repeats each action `amount` times, summing rewards and stopping early
/// when the episode ends.
pub struct ActionRepeat<E: Environment> {
    env: E,
    amount: u64,
}

impl<E: Environment> ActionRepeat<E> {
    pub fn new(env: E, amount: u64) -> Self {
        Self {
            env,
            amount: amount.max(1),
        }
    }
}

impl<E: Environment> Environment for ActionRepeat<E> {
    fn action_space(&self) -> DynSpace {
        self.env.action_space()
    }

    fn proprio_size(&self) -> Option<usize> {
        self.env.proprio_size()
    }

    fn reset(&mut self) -> Result<Observation> {
        self.env.reset()
    }

    fn step(&mut self, action: &[f32]) -> Result<StepResult> {
        let mut total_reward = 0.0;
        let mut result = self.env.step(action)?;
        total_reward += result.reward;
        for _ in 1..self.amount {
            if result.done {
                break;
            }
            result = self.env.step(action)?;
            total_reward += result.reward;
        }
        result.reward = total_reward;
        Ok(result)
    }
}

/// Exposes a `[-1, 1]` box and rescales actions onto the inner bounds.
/// Unbounded dimensions pass through unchanged.
pub struct NormalizeActions<E: Environment> {
    env: E,
    space: BoxSpace,
}

impl<E: Environment> NormalizeActions<E> {
    pub fn new(env: E) -> Result<Self> {
        match env.action_space() {
            DynSpace::Box(space) => Ok(Self { env, space }),
            DynSpace::Discrete(_) => Err(VmailError::Config(
                "NormalizeActions needs a box action space".into(),
            )),
        }
    }
}

impl<E: Environment> Environment for NormalizeActions<E> {
    fn action_space(&self) -> DynSpace {
        DynSpace::Box(BoxSpace::symmetric(&[self.space.low.len()]))
    }

    fn proprio_size(&self) -> Option<usize> {
        self.env.proprio_size()
    }

    fn reset(&mut self) -> Result<Observation> {
        self.env.reset()
    }

    fn step(&mut self, action: &[f32]) -> Result<StepResult> {
        let scaled = self.space.denormalize(action);
        let action: Vec<f32> = scaled
            .iter()
            .zip(action)
            .zip(self.space.low.iter().zip(self.space.high.iter()))
            .map(|((&s, &a), (l, h))| if l.is_finite() && h.is_finite() { s } else { a })
            .collect();
        self.env.step(&action)
    }
}

/// Converts a one-hot agent action to the index a discrete task expects.
pub struct OneHotAction<E: Environment> {
    env: E,
    n: usize,
}

impl<E: Environment> OneHotAction<E> {
    pub fn new(env: E) -> Result<Self> {
        match env.action_space() {
            DynSpace::Discrete(space) => Ok(Self { env, n: space.n }),
            DynSpace::Box(_) => Err(VmailError::Config(
                "OneHotAction needs a discrete action space".into(),
            )),
        }
    }
}

impl<E: Environment> Environment for OneHotAction<E> {
    fn action_space(&self) -> DynSpace {
        self.env.action_space()
    }

    fn proprio_size(&self) -> Option<usize> {
        self.env.proprio_size()
    }

    fn reset(&mut self) -> Result<Observation> {
        self.env.reset()
    }

    fn step(&mut self, action: &[f32]) -> Result<StepResult> {
        let index = crate::spaces::Discrete::new(self.n).from_one_hot(action);
        self.env.step(&[index as f32])
    }
}

/// Ends the episode after `duration` steps. The continuation flag stays 1
/// because the episode was cut, not terminated.
pub struct TimeLimit<E: Environment> {
    env: E,
    duration: u64,
    step: Option<u64>,
}

impl<E: Environment> TimeLimit<E> {
    pub fn new(env: E, duration: u64) -> Self {
        Self {
            env,
            duration,
            step: None,
        }
    }

    pub fn inner(&self) -> &E {
        &self.env
    }
}

impl<E: Environment> Environment for TimeLimit<E> {
    fn action_space(&self) -> DynSpace {
        self.env.action_space()
    }

    fn proprio_size(&self) -> Option<usize> {
        self.env.proprio_size()
    }

    fn reset(&mut self) -> Result<Observation> {
        self.step = Some(0);
        self.env.reset()
    }

    fn step(&mut self, action: &[f32]) -> Result<StepResult> {
        let step = self
            .step
            .ok_or_else(|| VmailError::Data("step called before reset".into()))?;
        let mut result = self.env.step(action)?;
        let step = step + 1;
        if step >= self.duration {
            result.done = true;
            self.step = None;
        } else {
            self.step = Some(step);
        }
        Ok(result)
    }
}

/// Called with every finished episode.
pub type EpisodeSink = Box<dyn FnMut(&Episode) -> Result<()> + Send>;

/// Records transitions and hands each completed episode to the sinks.
///
/// The first transition of an episode holds the reset observation with a
/// zero action, reward 0 and discount 1.
pub struct Collect<E: Environment> {
    env: E,
    sinks: Vec<EpisodeSink>,
    episode: Vec<Transition>,
}

impl<E: Environment> Collect<E> {
    pub fn new(env: E, sinks: Vec<EpisodeSink>) -> Self {
        Self {
            env,
            sinks,
            episode: Vec::new(),
        }
    }

    pub fn inner(&self) -> &E {
        &self.env
    }
}

impl<E: Environment> Environment for Collect<E> {
    fn action_space(&self) -> DynSpace {
        self.env.action_space()
    }

    fn proprio_size(&self) -> Option<usize> {
        self.env.proprio_size()
    }

    fn reset(&mut self) -> Result<Observation> {
        let observation = self.env.reset()?;
        self.episode = vec![Transition {
            observation: observation.clone(),
            action: vec![0.0; self.env.action_space().action_dim()],
            reward: 0.0,
            discount: 1.0,
        }];
        Ok(observation)
    }

    fn step(&mut self, action: &[f32]) -> Result<StepResult> {
        let result = self.env.step(action)?;
        self.episode.push(Transition {
            observation: result.observation.clone(),
            action: action.to_vec(),
            reward: result.reward,
            discount: result.info.discount,
        });
        if result.done {
            let episode = Episode::from_transitions(&std::mem::take(&mut self.episode))?;
            for sink in &mut self.sinks {
                sink(&episode)?;
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvInfo;
    use crate::spaces::Discrete;
    use ndarray::Array3;
    use std::sync::{Arc, Mutex};

    /// Counts steps, records the last action, terminates after `end` steps.
    struct Counter {
        steps: u64,
        end: u64,
        last_action: Arc<Mutex<Vec<f32>>>,
        space: DynSpace,
    }

    impl Counter {
        fn new(end: u64, space: DynSpace) -> Self {
            Self {
                steps: 0,
                end,
                last_action: Arc::default(),
                space,
            }
        }
    }

    impl Environment for Counter {
        fn action_space(&self) -> DynSpace {
            self.space.clone()
        }

        fn reset(&mut self) -> Result<Observation> {
            self.steps = 0;
            Ok(Observation::new(Array3::zeros((64, 64, 3))))
        }

        fn step(&mut self, action: &[f32]) -> Result<StepResult> {
            self.steps += 1;
            *self.last_action.lock().unwrap() = action.to_vec();
            let done = self.steps >= self.end;
            Ok(StepResult {
                observation: Observation::new(Array3::zeros((64, 64, 3))),
                reward: 1.0,
                done,
                info: if done { EnvInfo::terminal() } else { EnvInfo::new() },
            })
        }
    }

    fn unit_box() -> DynSpace {
        DynSpace::Box(BoxSpace::uniform(&[2], 0.0, 4.0))
    }

    #[test]
    fn test_action_repeat_sums_and_stops() {
        let mut env = ActionRepeat::new(Counter::new(5, unit_box()), 3);
        env.reset().unwrap();
        assert_eq!(env.step(&[0.0, 0.0]).unwrap().reward, 3.0);
        let last = env.step(&[0.0, 0.0]).unwrap();
        assert!(last.done);
        assert_eq!(last.reward, 2.0);
    }

    #[test]
    fn test_normalize_actions_rescales() {
        let inner = Counter::new(5, unit_box());
        let seen = Arc::clone(&inner.last_action);
        let mut env = NormalizeActions::new(inner).unwrap();
        match env.action_space() {
            DynSpace::Box(b) => {
                assert_eq!(b.low.iter().copied().collect::<Vec<_>>(), vec![-1.0, -1.0])
            }
            other => panic!("unexpected space {:?}", other),
        }
        env.reset().unwrap();
        env.step(&[-1.0, 0.5]).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0.0, 3.0]);
    }

    #[test]
    fn test_one_hot_action_passes_index() {
        let inner = Counter::new(5, DynSpace::Discrete(Discrete::new(3)));
        let seen = Arc::clone(&inner.last_action);
        let mut env = OneHotAction::new(inner).unwrap();
        env.reset().unwrap();
        env.step(&[0.0, 1.0, 0.0]).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1.0]);
        assert!(OneHotAction::new(Counter::new(1, unit_box())).is_err());
    }

    #[test]
    fn test_time_limit_truncates() {
        let mut env = TimeLimit::new(Counter::new(100, unit_box()), 2);
        env.reset().unwrap();
        assert!(!env.step(&[0.0, 0.0]).unwrap().done);
        let result = env.step(&[0.0, 0.0]).unwrap();
        assert!(result.done);
        assert_eq!(result.info.discount, 1.0);
        assert!(env.step(&[0.0, 0.0]).is_err());
    }

    #[test]
    fn test_collect_hands_over_episode() {
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let sink_lengths = Arc::clone(&lengths);
        let sink: EpisodeSink = Box::new(move |episode: &Episode| {
            sink_lengths
                .lock()
                .unwrap()
                .push((episode.len(), episode.total_reward()));
            let first_action = episode.action.get(0).abs().sum(tch::Kind::Float);
            assert_eq!(first_action.double_value(&[]), 0.0);
            let last_discount = episode.discount.as_ref().unwrap().double_value(&[3]);
            assert_eq!(last_discount, 0.0);
            Ok(())
        });
        let mut env = Collect::new(Counter::new(3, unit_box()), vec![sink]);
        env.reset().unwrap();
        for _ in 0..3 {
            env.step(&[1.0, 1.0]).unwrap();
        }
        assert_eq!(*lengths.lock().unwrap(), vec![(4, 3.0)]);
    }
}
