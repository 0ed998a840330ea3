//! The acting and training loop seen by the environment driver.

use super::distributed::{
    LocalBackend, ReplicaBackend, ReplicaPool, ReplicaWorker, SyncGroup, ThreadBackend,
};
use super::exploration::explore;
use super::learner::Learner;
use super::metrics::TrainContext;
use super::schedule::{Every, Once};
use crate::checkpoint::{CheckpointManager, Checkpointable};
use crate::config::{ActionDist, VmailConfig};
use crate::data::{observation_batch, EpisodeDataset};
use crate::env::Observation;
use crate::log::MetricLogger;
use crate::model::LatentState;
use crate::spaces::DynSpace;
use crate::{Result, VmailError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Instant;
use tch::{Device, Kind, Tensor};

/// Recurrent policy state carried between calls: the last posterior and
/// the last action taken.
pub type AgentState = (LatentState, Tensor);

/// Anything that can drive a batch of environments.
pub trait Agent {
    /// Choose one action per observation.
    ///
    /// `reset[i]` marks environments whose episode just started; their part
    /// of `state` is zeroed before use.
    fn act(
        &mut self,
        observations: &[Observation],
        reset: &[bool],
        state: Option<AgentState>,
        training: bool,
        ctx: &mut TrainContext,
    ) -> Result<(Vec<Vec<f32>>, Option<AgentState>)>;
}

/// Uniform random actions, used to prefill the replay directories.
pub struct RandomAgent {
    space: DynSpace,
    rng: StdRng,
}

impl RandomAgent {
    pub fn new(space: DynSpace, seed: u64) -> Self {
        Self {
            space,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Agent for RandomAgent {
    fn act(
        &mut self,
        observations: &[Observation],
        _reset: &[bool],
        _state: Option<AgentState>,
        _training: bool,
        _ctx: &mut TrainContext,
    ) -> Result<(Vec<Vec<f32>>, Option<AgentState>)> {
        let actions = observations
            .iter()
            .map(|_| self.space.sample_action(&mut self.rng))
            .collect();
        Ok((actions, None))
    }
}

/// Model and expert samplers for one replica. Each replica draws its own
/// full batch from a differently seeded generator.
fn replica_datasets(config: &VmailConfig, rank: usize) -> (EpisodeDataset, EpisodeDataset) {
    let seed = config.seed.wrapping_add(rank as u64);
    let model = EpisodeDataset::new(
        &config.model_datadir,
        config.batch_length,
        config.dataset_balance,
        seed,
    );
    let expert = EpisodeDataset::new(
        &config.expert_datadir,
        config.batch_length,
        config.dataset_balance,
        seed.wrapping_add(config.replicas as u64),
    );
    (model, expert)
}

/// One sampled model batch and expert batch, then a joint update.
fn train_once(
    config: &VmailConfig,
    learner: &mut Learner,
    model_data: &mut EpisodeDataset,
    expert_data: &mut EpisodeDataset,
    ctx: &mut TrainContext,
) -> Result<()> {
    let model = model_data.sample_batch(config)?;
    let expert = expert_data.sample_batch(config)?;
    let output = learner.train_step(&model, &expert, ctx)?;
    if !output.is_finite() {
        tracing::warn!(
            rank = learner.rank(),
            model_loss = output.model_loss,
            discriminator_loss = output.discriminator_loss,
            "non-finite loss"
        );
    }
    Ok(())
}

/// A replica on a worker thread.
struct ReplicaTrainer {
    config: VmailConfig,
    learner: Learner,
    model_data: EpisodeDataset,
    expert_data: EpisodeDataset,
    ctx: TrainContext,
}

impl ReplicaTrainer {
    fn new(
        config: VmailConfig,
        action_dim: i64,
        proprio_dim: Option<i64>,
        backend: ThreadBackend,
    ) -> Result<Self> {
        let rank = backend.rank();
        let learner = Learner::new(&config, action_dim, proprio_dim, Box::new(backend))?;
        let (model_data, expert_data) = replica_datasets(&config, rank);
        Ok(Self {
            config,
            learner,
            model_data,
            expert_data,
            ctx: TrainContext::default(),
        })
    }
}

impl ReplicaWorker for ReplicaTrainer {
    fn train(&mut self, steps: u64) -> Result<()> {
        for _ in 0..steps {
            train_once(
                &self.config,
                &mut self.learner,
                &mut self.model_data,
                &mut self.expert_data,
                &mut self.ctx,
            )?;
        }
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        self.learner.synchronize_all()
    }
}

/// Imitation agent: trains on schedule and acts with the learned policy.
///
/// Rank 0 lives here; with `replicas > 1` the remaining ranks run on a
/// [`ReplicaPool`] and train in lockstep whenever this agent trains.
pub struct VmailAgent {
    config: VmailConfig,
    learner: Learner,
    model_data: EpisodeDataset,
    expert_data: EpisodeDataset,
    should_pretrain: Once,
    should_train: Every,
    should_log: Every,
    pool: Option<ReplicaPool>,
    loggers: Arc<dyn MetricLogger>,
    last_log: Option<(u64, Instant)>,
}

impl VmailAgent {
    pub fn new(
        config: &VmailConfig,
        action_space: &DynSpace,
        proprio_dim: Option<i64>,
        loggers: Arc<dyn MetricLogger>,
    ) -> Result<Self> {
        if action_space.is_discrete() != (config.action_dist == ActionDist::Onehot) {
            return Err(VmailError::Config(format!(
                "action_dist {} does not match the action space {:?}",
                config.action_dist, action_space
            )));
        }
        let action_dim = action_space.action_dim() as i64;

        let (pool, backend): (Option<ReplicaPool>, Box<dyn ReplicaBackend>) =
            if config.replicas > 1 {
                let group = SyncGroup::new(config.replicas);
                let worker_config = config.clone();
                // Workers must exist before the leader's learner broadcasts.
                let pool = ReplicaPool::spawn(&group, move |backend| {
                    ReplicaTrainer::new(worker_config.clone(), action_dim, proprio_dim, backend)
                })?;
                (Some(pool), Box::new(ThreadBackend::new(0, group)))
            } else {
                (None, Box::new(LocalBackend))
            };

        let learner = Learner::new(config, action_dim, proprio_dim, backend)?;
        let (model_data, expert_data) = replica_datasets(config, 0);
        tracing::info!(
            replicas = config.replicas,
            action_dim,
            device = ?config.device,
            "agent ready"
        );
        Ok(Self {
            config: config.clone(),
            learner,
            model_data,
            expert_data,
            should_pretrain: Once::new(),
            should_train: Every::new(config.train_every),
            should_log: Every::new(config.log_every),
            pool,
            loggers,
            last_log: None,
        })
    }

    pub fn learner(&self) -> &Learner {
        &self.learner
    }

    pub fn config(&self) -> &VmailConfig {
        &self.config
    }

    /// Run `steps` joint updates on every replica.
    pub fn train(&mut self, steps: u64, ctx: &mut TrainContext) -> Result<()> {
        if let Some(pool) = &self.pool {
            pool.start_train(steps)?;
        }
        for _ in 0..steps {
            let result = train_once(
                &self.config,
                &mut self.learner,
                &mut self.model_data,
                &mut self.expert_data,
                ctx,
            );
            if let Err(e) = result {
                // A replica that failed first is the real cause
                return Err(self.pool.as_ref().and_then(ReplicaPool::failure).unwrap_or(e));
            }
        }
        if let Some(pool) = &self.pool {
            pool.wait()?;
        }
        Ok(())
    }

    /// Flush running metrics to every logger, adding `fps` since the last
    /// flush.
    pub fn write_summaries(&mut self, ctx: &mut TrainContext) {
        let step = ctx.step;
        let mut metrics = ctx.metrics.flush();
        let now = Instant::now();
        if let Some((last_step, last_time)) = self.last_log {
            let elapsed = now.duration_since(last_time).as_secs_f64();
            if elapsed > 0.0 {
                metrics.insert(
                    "fps".to_string(),
                    step.saturating_sub(last_step) as f64 / elapsed,
                );
            }
        }
        self.last_log = Some((step, now));
        self.loggers.log_metrics(&metrics, step);
    }

    /// Restore learner state from `manager` and push it to every replica.
    pub fn restore(&mut self, manager: &CheckpointManager) -> Result<Option<u64>> {
        let step = manager.load(&mut self.learner)?;
        if step.is_some() {
            if let Some(pool) = &self.pool {
                pool.start_synchronize()?;
                self.learner.synchronize_all()?;
                pool.wait()?;
            }
        }
        Ok(step)
    }

    pub fn save(&self, manager: &CheckpointManager, step: u64) -> Result<()> {
        manager.save(&self.learner, step)?;
        Ok(())
    }

    /// Stop the replica threads.
    pub fn shutdown(mut self) -> Result<()> {
        self.loggers.close();
        match self.pool.take() {
            Some(pool) => pool.join(),
            None => Ok(()),
        }
    }

    fn policy(
        &self,
        observations: &[Observation],
        state: Option<AgentState>,
        training: bool,
        ctx: &mut TrainContext,
    ) -> Result<(Vec<Vec<f32>>, AgentState)> {
        let device = self.learner.device();
        let (image, proprio) = observation_batch(observations, &self.config, device)?;
        let (action, latent) = self
            .learner
            .policy(&image, proprio.as_ref(), state, training)?;
        let action = explore(&action, &self.config, training, ctx);

        let width = self.learner.action_dim() as usize;
        let flat = action.to_device(Device::Cpu).to_kind(Kind::Float).flatten(0, -1);
        let flat = Vec::<f32>::try_from(&flat)?;
        let actions = flat.chunks(width).map(<[f32]>::to_vec).collect();
        Ok((actions, (latent, action)))
    }
}

fn mask_state(state: AgentState, reset: &[bool]) -> AgentState {
    let (latent, action) = state;
    let keep: Vec<f32> = reset.iter().map(|&r| if r { 0.0 } else { 1.0 }).collect();
    let keep = Tensor::from_slice(&keep).to_device(action.device());
    let action = &action * keep.unsqueeze(-1);
    (latent.masked(&keep), action)
}

impl Agent for VmailAgent {
    fn act(
        &mut self,
        observations: &[Observation],
        reset: &[bool],
        state: Option<AgentState>,
        training: bool,
        ctx: &mut TrainContext,
    ) -> Result<(Vec<Vec<f32>>, Option<AgentState>)> {
        let state = match state {
            Some(state) if reset.iter().any(|&r| r) => Some(mask_state(state, reset)),
            state => state,
        };

        if training && self.should_train.check(ctx.step) {
            let log = self.should_log.check(ctx.step);
            let steps = if self.should_pretrain.check() {
                self.config.pretrain
            } else {
                self.config.train_steps
            };
            tracing::info!(steps, step = ctx.step, "training");
            self.train(steps, ctx)?;
            if log {
                self.write_summaries(ctx);
            }
        }

        let (actions, state) = self.policy(observations, state, training, ctx)?;
        if training {
            ctx.step += observations.len() as u64 * self.config.action_repeat;
        }
        Ok((actions, Some(state)))
    }
}

impl Checkpointable for VmailAgent {
    fn named_tensors(&self) -> Vec<(String, Tensor)> {
        self.learner.named_tensors()
    }

    fn load_named_tensors(&mut self, tensors: &[(String, Tensor)]) -> Result<()> {
        self.learner.load_named_tensors(tensors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::NoOpLogger;
    use crate::spaces::{Box as BoxSpace, Discrete};
    use ndarray::{Array1, Array3};

    fn observations(n: usize) -> Vec<Observation> {
        (0..n)
            .map(|_| {
                Observation::new(Array3::zeros((64, 64, 3))).with_proprio(Array1::zeros(4))
            })
            .collect()
    }

    #[test]
    fn test_random_agent_shapes() {
        let mut agent = RandomAgent::new(DynSpace::Discrete(Discrete::new(3)), 0);
        let mut ctx = TrainContext::new(0);
        let (actions, state) = agent
            .act(&observations(2), &[true, true], None, true, &mut ctx)
            .unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].len(), 3);
        assert!(state.is_none());
    }

    #[test]
    fn test_mask_state_zeroes_reset_rows() {
        let latent = LatentState {
            mean: Tensor::ones([2, 3], (Kind::Float, Device::Cpu)),
            std: Tensor::ones([2, 3], (Kind::Float, Device::Cpu)),
            stoch: Tensor::ones([2, 3], (Kind::Float, Device::Cpu)),
            deter: Tensor::ones([2, 4], (Kind::Float, Device::Cpu)),
        };
        let action = Tensor::ones([2, 2], (Kind::Float, Device::Cpu));
        let (latent, action) = mask_state((latent, action), &[false, true]);
        assert_eq!(latent.deter.sum(Kind::Float).double_value(&[]), 4.0);
        assert_eq!(action.double_value(&[1, 0]), 0.0);
        assert_eq!(action.double_value(&[0, 0]), 1.0);
    }

    #[test]
    fn test_eval_act_does_not_advance_step() {
        let config = VmailConfig::small().with_latent(2, 3);
        let space = DynSpace::Box(BoxSpace::symmetric(&[2]));
        let mut agent = VmailAgent::new(&config, &space, Some(4), Arc::new(NoOpLogger)).unwrap();
        let mut ctx = TrainContext::new(5);
        let (actions, state) = agent
            .act(&observations(3), &[true, true, true], None, false, &mut ctx)
            .unwrap();
        assert_eq!(ctx.step, 5);
        assert_eq!(actions.len(), 3);
        assert!(actions.iter().flatten().all(|a| (-1.0..=1.0).contains(a)));
        assert_eq!(state.unwrap().1.size(), vec![3, 2]);
    }

    #[test]
    fn test_mismatched_action_dist_is_rejected() {
        let config = VmailConfig::small();
        let space = DynSpace::Discrete(Discrete::new(4));
        assert!(VmailAgent::new(&config, &space, Some(4), Arc::new(NoOpLogger)).is_err());
    }
}
