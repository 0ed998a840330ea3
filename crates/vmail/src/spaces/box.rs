//! Continuous action space.

use super::Space;
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_distr::{Distribution, Uniform};

/// Continuous values bounded per element
#[derive(Clone, Debug)]
pub struct Box {
    /// Lower bound for each element
    pub low: ArrayD<f32>,
    /// Upper bound for each element
    pub high: ArrayD<f32>,
    /// Shape of the space
    shape: Vec<usize>,
}

impl Box {
    /// Bounds must share a shape; mismatched shapes keep `low`'s shape and
    /// broadcast `high` from its first element.
    pub fn new(low: ArrayD<f32>, high: ArrayD<f32>) -> Self {
        let shape = low.shape().to_vec();
        let high = if high.shape() == low.shape() {
            high
        } else {
            ArrayD::from_elem(IxDyn(&shape), high.iter().next().copied().unwrap_or(1.0))
        };
        Self { low, high, shape }
    }

    pub fn uniform(shape: &[usize], low: f32, high: f32) -> Self {
        Self::new(
            ArrayD::from_elem(IxDyn(shape), low),
            ArrayD::from_elem(IxDyn(shape), high),
        )
    }

    /// `[-1, 1]` in every element.
    pub fn symmetric(shape: &[usize]) -> Self {
        Self::uniform(shape, -1.0, 1.0)
    }

    /// Map an action in `[-1, 1]` onto the bounds.
    pub fn denormalize(&self, action: &[f32]) -> Vec<f32> {
        action
            .iter()
            .zip(self.low.iter().zip(self.high.iter()))
            .map(|(&a, (&l, &h))| (a.clamp(-1.0, 1.0) + 1.0) / 2.0 * (h - l) + l)
            .collect()
    }
}

impl Space for Box {
    type Sample = ArrayD<f32>;

    fn sample<R: Rng>(&self, rng: &mut R) -> Self::Sample {
        let mut result = ArrayD::zeros(IxDyn(&self.shape));
        for ((&l, &h), r) in self.low.iter().zip(self.high.iter()).zip(result.iter_mut()) {
            *r = Uniform::new_inclusive(l, h).sample(rng);
        }
        result
    }

    fn contains(&self, value: &Self::Sample) -> bool {
        if value.shape() != self.low.shape() {
            return false;
        }
        value.iter()
            .zip(self.low.iter())
            .zip(self.high.iter())
            .all(|((&v, &l), &h)| v >= l && v <= h)
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }
}
