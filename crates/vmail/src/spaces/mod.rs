//! Action space types.
//!
//! The agent always emits a flat `f32` vector: box actions in `[-1, 1]`
//! (rescaled by `NormalizeActions`) or a one-hot vector for discrete spaces.

mod r#box;
mod discrete;

pub use discrete::Discrete;
pub use r#box::Box;

use rand::Rng;

/// Trait for bounded spaces that can be sampled.
pub trait Space: Clone + Send + Sync {
    type Sample;

    fn sample<R: Rng>(&self, rng: &mut R) -> Self::Sample;

    fn contains(&self, value: &Self::Sample) -> bool;

    fn shape(&self) -> &[usize];

    fn num_elements(&self) -> usize {
        self.shape().iter().product()
    }
}

/// Action space of an environment.
#[derive(Clone, Debug)]
pub enum DynSpace {
    Discrete(Discrete),
    Box(Box),
}

impl DynSpace {
    /// Width of the action vector the agent produces.
    pub fn action_dim(&self) -> usize {
        match self {
            DynSpace::Discrete(s) => s.n,
            DynSpace::Box(s) => s.num_elements(),
        }
    }

    pub fn is_discrete(&self) -> bool {
        matches!(self, DynSpace::Discrete(_))
    }

    /// A uniformly random action in agent format: one-hot for discrete
    /// spaces, `[-1, 1]` for boxes.
    pub fn sample_action<R: Rng>(&self, rng: &mut R) -> Vec<f32> {
        match self {
            DynSpace::Discrete(s) => {
                let mut action = vec![0.0; s.n];
                action[s.sample(rng)] = 1.0;
                action
            }
            DynSpace::Box(s) => Box::symmetric(s.shape())
                .sample(rng)
                .into_iter()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_sample_action_format() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let discrete = DynSpace::Discrete(Discrete::new(4));
        let action = discrete.sample_action(&mut rng);
        assert_eq!(action.len(), 4);
        assert_eq!(action.iter().sum::<f32>(), 1.0);

        let boxed = DynSpace::Box(Box::uniform(&[2], -3.0, 3.0));
        assert_eq!(boxed.action_dim(), 2);
        let action = boxed.sample_action(&mut rng);
        assert!(action.iter().all(|a| (-1.0..=1.0).contains(a)));
    }
}
