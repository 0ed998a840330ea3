//! Training core.
//!
//! Provides:
//! - `Learner`: the four networks, their optimizers and the joint step
//! - `VmailAgent`: train-on-schedule plus acting, with optional replicas
//! - `ReplicaBackend` / `SyncGroup` / `ReplicaPool`: synchronous data parallelism
//! - imagination, lambda returns, discriminator losses and exploration

mod agent;
mod discriminator;
mod distributed;
mod exploration;
mod imagine;
mod learner;
mod metrics;
mod optimizer;
mod returns;
mod schedule;

pub use agent::{Agent, AgentState, RandomAgent, VmailAgent};
pub use discriminator::{discriminator_losses, gradient_penalty, DiscriminatorLosses};
pub use distributed::{
    LocalBackend, ReplicaBackend, ReplicaPool, ReplicaWorker, SyncGroup, ThreadBackend,
};
pub use exploration::{explore, perturb, training_amount};
pub use imagine::{imagine_ahead, Imagination};
pub use learner::{Learner, TrainOutput};
pub use metrics::{Metrics, TrainContext};
pub use optimizer::{
    clip_by_global_norm, global_norm, Adam, GradScaler, ModuleOptimizer, OptimizerSettings,
    ParamGroup, UpdateRule,
};
pub use returns::{discount_weights, lambda_return};
pub use schedule::{Every, Once};
