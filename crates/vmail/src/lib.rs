//! # vmail
//!
//! Visual model-based adversarial imitation learning in Rust.
//!
//! ## Overview
//!
//! vmail learns to imitate expert demonstrations from image and
//! proprioceptive observations. One training step jointly fits:
//! - a recurrent state-space world model (`model::Rssm`) with image reconstruction,
//! - a discriminator whose output on imagined trajectories is the reward,
//! - an actor and a value function trained purely on imagined rollouts.
//!
//! The training core lives in [`training`]; episode storage, environments,
//! logging and checkpointing are the plumbing around it.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vmail::prelude::*;
//!
//! let config = VmailConfig::default();
//! let mut learner = Learner::new(&config, 2, Some(4), Box::new(LocalBackend))?;
//! let mut ctx = TrainContext::new(0);
//! let out = learner.train_step(&model_batch, &expert_batch, &mut ctx)?;
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod env;
pub mod log;
pub mod model;
pub mod runner;
pub mod spaces;
pub mod training;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{
        ActionDist, Activation, ClipRewards, Exploration, Precision, VmailConfig,
    };
    pub use crate::data::{Batch, Episode, EpisodeDataset};
    pub use crate::env::{EnvInfo, Environment, Observation, StepResult};
    pub use crate::runner::{make_env, run, simulate, Limit};
    pub use crate::model::{LatentState, Rssm};
    pub use crate::spaces::{Box as BoxSpace, Discrete, DynSpace};
    pub use crate::training::{
        Agent, Learner, LocalBackend, Metrics, RandomAgent, ReplicaBackend, TrainContext,
        TrainOutput, VmailAgent,
    };

    pub use crate::checkpoint::{CheckpointManager, Checkpointable};
    #[cfg(feature = "tensorboard")]
    pub use crate::log::TensorBoardLogger;
    pub use crate::log::{CompositeLogger, ConsoleLogger, JsonlLogger, MetricLogger};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum VmailError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { expected: Vec<i64>, actual: Vec<i64> },

    #[error("Data error: {0}")]
    Data(String),

    #[error("Distributed error: {0}")]
    Distributed(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Tensor error: {0}")]
    Tensor(#[from] tch::TchError),
}

pub type Result<T> = core::result::Result<T, VmailError>;
