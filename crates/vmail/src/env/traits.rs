//! Core environment trait definitions.

use crate::spaces::DynSpace;
use crate::Result;
use ndarray::{Array1, Array3};

/// One observation from a visual control task.
#[derive(Clone, Debug)]
pub struct Observation {
    /// RGB frame `[H, W, 3]`
    pub image: Array3<u8>,
    /// Depth frame `[H, W, 1]`, when the task renders one
    pub depth: Option<Array3<f32>>,
    /// Joint positions and velocities
    pub proprio: Option<Array1<f32>>,
}

impl Observation {
    pub fn new(image: Array3<u8>) -> Self {
        Self {
            image,
            depth: None,
            proprio: None,
        }
    }

    pub fn with_depth(mut self, depth: Array3<f32>) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn with_proprio(mut self, proprio: Array1<f32>) -> Self {
        self.proprio = Some(proprio);
        self
    }
}

/// Extra step information.
#[derive(Clone, Debug, PartialEq)]
pub struct EnvInfo {
    /// Continuation flag stored with the transition; 0 on true termination
    pub discount: f32,
}

impl Default for EnvInfo {
    fn default() -> Self {
        Self { discount: 1.0 }
    }
}

impl EnvInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_discount(discount: f32) -> Self {
        Self { discount }
    }

    /// The episode ended because the task terminated.
    pub fn terminal() -> Self {
        Self::with_discount(0.0)
    }
}

/// Result from a single environment step
#[derive(Clone, Debug)]
pub struct StepResult {
    pub observation: Observation,
    pub reward: f32,
    /// Episode over, either by termination or by a time limit
    pub done: bool,
    pub info: EnvInfo,
}

/// A single-agent visual control task.
///
/// Actions arrive in agent format: a flat vector that is a one-hot encoding
/// for discrete spaces and box values otherwise.
pub trait Environment: Send {
    fn action_space(&self) -> DynSpace;

    /// Size of the proprioceptive vector, if the task provides one.
    fn proprio_size(&self) -> Option<usize> {
        None
    }

    fn reset(&mut self) -> Result<Observation>;

    fn step(&mut self, action: &[f32]) -> Result<StepResult>;
}

impl<E: Environment + ?Sized> Environment for Box<E> {
    fn action_space(&self) -> DynSpace {
        (**self).action_space()
    }

    fn proprio_size(&self) -> Option<usize> {
        (**self).proprio_size()
    }

    fn reset(&mut self) -> Result<Observation> {
        (**self).reset()
    }

    fn step(&mut self, action: &[f32]) -> Result<StepResult> {
        (**self).step(action)
    }
}
