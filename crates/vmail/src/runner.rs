//! Environment construction, the simulation driver and the run loop.

use crate::checkpoint::CheckpointManager;
use crate::config::VmailConfig;
use crate::data::{copy_episodes, count_episodes, count_steps, Episode};
use crate::env::{
    ActionRepeat, Collect, Environment, EpisodeSink, NormalizeActions, Observation, OneHotAction,
    TimeLimit,
};
use crate::log::MetricLogger;
use crate::spaces::DynSpace;
use crate::training::{Agent, AgentState, RandomAgent, TrainContext, VmailAgent};
use crate::{Result, VmailError};
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

/// Builds a fresh, unwrapped task instance; the argument is the env index.
pub type EnvFactory<'a> = dyn Fn(usize) -> Result<Box<dyn Environment>> + 'a;

/// Log the return and length of a finished episode under `prefix`.
pub fn summarize_episode(
    episode: &Episode,
    config: &VmailConfig,
    prefix: &str,
    logger: &dyn MetricLogger,
) -> Result<()> {
    let (episodes, _) = count_episodes(&config.policy_datadir)?;
    let length = (episode.len() - 1).max(0) as u64;
    let ret = episode.total_reward();
    tracing::info!(
        "{} episode of length {} with return {:.1}.",
        prefix,
        length * config.action_repeat,
        ret
    );
    let mut metrics = BTreeMap::new();
    metrics.insert(format!("{}/return", prefix), ret);
    metrics.insert(format!("{}/length", prefix), length as f64);
    metrics.insert("episodes".to_string(), episodes as f64);
    let step = count_steps(&config.policy_datadir, config.action_repeat)?;
    logger.log_metrics(&metrics, step);
    Ok(())
}

/// Stack the standard wrappers on a task. Finished episodes are stored in
/// the model and policy directories when `store` is set and summarised
/// under `prefix` either way.
pub fn make_env(
    config: &VmailConfig,
    env: Box<dyn Environment>,
    prefix: &'static str,
    logger: Arc<dyn MetricLogger>,
    store: bool,
) -> Result<Box<dyn Environment>> {
    let env = ActionRepeat::new(env, config.action_repeat);
    let env: Box<dyn Environment> = match env.action_space() {
        DynSpace::Box(_) => Box::new(NormalizeActions::new(env)?),
        DynSpace::Discrete(_) => Box::new(OneHotAction::new(env)?),
    };
    let env = TimeLimit::new(env, config.time_limit / config.action_repeat.max(1));

    let mut sinks: Vec<EpisodeSink> = Vec::new();
    if store {
        let model_dir = config.model_datadir.clone();
        sinks.push(Box::new(move |episode: &Episode| episode.save(&model_dir).map(|_| ())));
        let policy_dir = config.policy_datadir.clone();
        sinks.push(Box::new(move |episode: &Episode| episode.save(&policy_dir).map(|_| ())));
    }
    let summary_config = config.clone();
    sinks.push(Box::new(move |episode: &Episode| {
        summarize_episode(episode, &summary_config, prefix, logger.as_ref())
    }));
    Ok(Box::new(Collect::new(env, sinks)))
}

/// How long to simulate. Zero disables a bound; at least one must be set.
#[derive(Clone, Copy, Debug, Default)]
pub struct Limit {
    pub steps: u64,
    pub episodes: u64,
}

impl Limit {
    pub fn steps(steps: u64) -> Self {
        Self { steps, episodes: 0 }
    }

    pub fn episodes(episodes: u64) -> Self {
        Self { steps: 0, episodes }
    }
}

/// Progress carried between `simulate` calls so collection can resume
/// mid-episode.
pub struct Simulation {
    step: i64,
    episode: i64,
    done: Vec<bool>,
    length: Vec<i64>,
    observations: Vec<Option<Observation>>,
    agent_state: Option<AgentState>,
}

impl Simulation {
    /// Every environment is due for a reset.
    pub fn new(num_envs: usize) -> Self {
        Self {
            step: 0,
            episode: 0,
            done: vec![true; num_envs],
            length: vec![0; num_envs],
            observations: vec![None; num_envs],
            agent_state: None,
        }
    }
}

/// Step `envs` with `agent` until `limit` is reached.
///
/// Steps are credited when an episode finishes, so a call can overshoot
/// its step budget by up to one episode; the surplus is carried in the
/// returned state and subtracted from the next call's budget.
pub fn simulate(
    agent: &mut dyn Agent,
    envs: &mut [Box<dyn Environment>],
    limit: Limit,
    training: bool,
    ctx: &mut TrainContext,
    state: Option<Simulation>,
) -> Result<Simulation> {
    if limit.steps == 0 && limit.episodes == 0 {
        return Err(VmailError::Config("simulate needs a step or episode limit".into()));
    }
    let mut sim = state.unwrap_or_else(|| Simulation::new(envs.len()));
    let (steps, episodes) = (limit.steps as i64, limit.episodes as i64);

    while (steps > 0 && sim.step < steps) || (episodes > 0 && sim.episode < episodes) {
        for (i, env) in envs.iter_mut().enumerate() {
            if sim.done[i] {
                sim.observations[i] = Some(env.reset()?);
            }
        }
        let observations: Vec<Observation> = sim
            .observations
            .iter()
            .map(|o| o.clone().ok_or_else(|| VmailError::Data("missing observation".into())))
            .collect::<Result<_>>()?;

        let (actions, agent_state) =
            agent.act(&observations, &sim.done, sim.agent_state.take(), training, ctx)?;
        sim.agent_state = agent_state;
        if actions.len() != envs.len() {
            return Err(VmailError::ShapeMismatch {
                expected: vec![envs.len() as i64],
                actual: vec![actions.len() as i64],
            });
        }

        for (i, (env, action)) in envs.iter_mut().zip(&actions).enumerate() {
            let result = env.step(action)?;
            sim.observations[i] = Some(result.observation);
            sim.done[i] = result.done;
            sim.length[i] += 1;
            if result.done {
                sim.episode += 1;
                sim.step += sim.length[i];
                sim.length[i] = 0;
            }
        }
    }

    sim.step -= steps;
    sim.episode -= episodes;
    Ok(sim)
}

fn build_envs(
    config: &VmailConfig,
    factory: &EnvFactory,
    prefix: &'static str,
    logger: &Arc<dyn MetricLogger>,
    store: bool,
) -> Result<Vec<Box<dyn Environment>>> {
    (0..config.num_envs.max(1))
        .map(|i| make_env(config, factory(i)?, prefix, Arc::clone(logger), store))
        .collect()
}

/// Full training run: seed the model directory with expert episodes,
/// prefill with random actions, then alternate evaluation, collection and
/// checkpointing until `config.steps` environment steps are stored.
///
/// `on_step` receives the step count after every collection round.
pub fn run(
    config: &VmailConfig,
    factory: &EnvFactory,
    logger: Arc<dyn MetricLogger>,
    mut on_step: impl FnMut(u64),
) -> Result<u64> {
    config.validate()?;
    crate::utils::set_seed(config.seed);
    for dir in [
        &config.logdir,
        &config.model_datadir,
        &config.policy_datadir,
        &config.expert_datadir,
    ] {
        fs::create_dir_all(dir)?;
    }
    fs::write(
        config.logdir.join("config.json"),
        serde_json::to_vec_pretty(config)?,
    )?;

    let copied = copy_episodes(&config.expert_datadir, &config.model_datadir)?;
    tracing::info!(copied, from = %config.expert_datadir.display(), "copied expert episodes");

    let mut train_envs = build_envs(config, factory, "train", &logger, config.store)?;
    let mut test_envs = build_envs(config, factory, "test", &logger, false)?;
    let action_space = train_envs[0].action_space();
    let proprio_dim = train_envs[0].proprio_size().map(|p| p as i64);

    let stored = count_steps(&config.model_datadir, config.action_repeat)?;
    let prefill = config.prefill.saturating_sub(stored);
    tracing::info!("Prefill dataset with {} steps.", prefill);
    let mut ctx = TrainContext::new(0);
    if prefill > 0 {
        let mut random = RandomAgent::new(action_space.clone(), config.seed);
        simulate(
            &mut random,
            &mut train_envs,
            Limit::steps(prefill / config.action_repeat.max(1)),
            true,
            &mut ctx,
            None,
        )?;
    }

    ctx.step = count_steps(&config.policy_datadir, config.action_repeat)?;
    tracing::info!(
        "Simulating agent for {} steps.",
        config.steps.saturating_sub(ctx.step)
    );
    let mut agent = VmailAgent::new(config, &action_space, proprio_dim, Arc::clone(&logger))?;
    let manager = CheckpointManager::new(&config.logdir)?;
    if agent.restore(&manager)?.is_some() {
        tracing::info!("Load checkpoint.");
    }

    let mut collection = None;
    while ctx.step < config.steps {
        tracing::info!("{}/{}, Start evaluation.", ctx.step, config.steps);
        simulate(&mut agent, &mut test_envs, Limit::episodes(1), false, &mut ctx, None)?;
        tracing::info!("Start collection.");
        let steps = (config.eval_every / config.action_repeat.max(1)).max(1);
        collection = Some(simulate(
            &mut agent,
            &mut train_envs,
            Limit::steps(steps),
            true,
            &mut ctx,
            collection,
        )?);
        ctx.step = count_steps(&config.policy_datadir, config.action_repeat)?;
        agent.save(&manager, ctx.step)?;
        on_step(ctx.step);
    }

    agent.shutdown()?;
    Ok(ctx.step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{EnvInfo, StepResult};
    use crate::log::NoOpLogger;
    use crate::spaces::Box as BoxSpace;
    use ndarray::{Array1, Array3};
    use tempfile::TempDir;

    /// Episode ends after `end` steps.
    struct Fixed {
        steps: u64,
        end: u64,
    }

    impl Environment for Fixed {
        fn action_space(&self) -> DynSpace {
            DynSpace::Box(BoxSpace::uniform(&[2], -2.0, 2.0))
        }

        fn proprio_size(&self) -> Option<usize> {
            Some(4)
        }

        fn reset(&mut self) -> Result<Observation> {
            self.steps = 0;
            Ok(Observation::new(Array3::zeros((64, 64, 3))).with_proprio(Array1::zeros(4)))
        }

        fn step(&mut self, _action: &[f32]) -> Result<StepResult> {
            self.steps += 1;
            let done = self.steps >= self.end;
            Ok(StepResult {
                observation: Observation::new(Array3::zeros((64, 64, 3)))
                    .with_proprio(Array1::zeros(4)),
                reward: 1.0,
                done,
                info: if done { EnvInfo::terminal() } else { EnvInfo::new() },
            })
        }
    }

    fn fixed(end: u64) -> Box<dyn Environment> {
        Box::new(Fixed { steps: 0, end })
    }

    #[test]
    fn test_simulate_carries_surplus() {
        let mut envs = vec![fixed(4)];
        let mut agent = RandomAgent::new(DynSpace::Box(BoxSpace::symmetric(&[2])), 0);
        let mut ctx = TrainContext::new(0);
        let sim = simulate(&mut agent, &mut envs, Limit::steps(6), true, &mut ctx, None).unwrap();
        // two episodes of four steps against a budget of six
        assert_eq!(sim.step, 2);
        assert_eq!(sim.episode, 2);
        let sim =
            simulate(&mut agent, &mut envs, Limit::steps(6), true, &mut ctx, Some(sim)).unwrap();
        assert_eq!(sim.step, 0);
    }

    #[test]
    fn test_make_env_stores_episodes() {
        let dir = TempDir::new().unwrap();
        let config = VmailConfig::default().with_basedir(dir.path());
        let mut env = make_env(&config, fixed(3), "train", Arc::new(NoOpLogger), true).unwrap();
        let mut agent = RandomAgent::new(env.action_space(), 1);
        let mut ctx = TrainContext::new(0);
        simulate(
            &mut agent,
            std::slice::from_mut(&mut env),
            Limit::episodes(2),
            true,
            &mut ctx,
            None,
        )
        .unwrap();
        assert_eq!(count_episodes(&config.model_datadir).unwrap(), (2, 6));
        assert_eq!(count_steps(&config.policy_datadir, 1).unwrap(), 6);
    }

    #[test]
    fn test_limit_is_required() {
        let mut envs = vec![fixed(2)];
        let mut agent = RandomAgent::new(DynSpace::Box(BoxSpace::symmetric(&[2])), 0);
        let mut ctx = TrainContext::new(0);
        assert!(simulate(&mut agent, &mut envs, Limit::default(), true, &mut ctx, None).is_err());
    }
}
