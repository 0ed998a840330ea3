//! Action perturbation applied when acting in a real environment.

use super::metrics::TrainContext;
use crate::config::{Exploration, VmailConfig};
use tch::{Kind, Tensor};

/// Noise scale during training: exponential decay with `expl_decay` as
/// half-life, floored at `expl_min`. Either knob is disabled when zero.
pub fn training_amount(config: &VmailConfig, step: u64) -> f64 {
    let mut amount = config.expl_amount;
    if config.expl_decay > 0.0 {
        amount *= 0.5f64.powf(step as f64 / config.expl_decay);
    }
    if config.expl_min > 0.0 {
        amount = amount.max(config.expl_min);
    }
    amount
}

/// Perturb `action: [B, A]` with the given variant and noise scale.
pub fn perturb(action: &Tensor, kind: Exploration, amount: f64) -> Tensor {
    match kind {
        Exploration::AdditiveGaussian => {
            (action + action.randn_like() * amount).clamp(-1.0, 1.0)
        }
        Exploration::CompletelyRandom => action.rand_like() * 2.0 - 1.0,
        Exploration::EpsilonGreedy => {
            let size = action.size();
            let classes = size[size.len() - 1];
            let batch = &size[..size.len() - 1];
            let random = Tensor::randint(classes, batch, (Kind::Int64, action.device()))
                .one_hot(classes)
                .to_kind(action.kind());
            let replace = Tensor::rand(batch, (Kind::Float, action.device()))
                .lt(amount)
                .unsqueeze(-1);
            random.where_self(&replace, action)
        }
    }
}

/// Exploration for one environment interaction. Training records the noise
/// scale as `expl_amount`; evaluation uses `eval_noise` or leaves the action
/// untouched.
pub fn explore(
    action: &Tensor,
    config: &VmailConfig,
    training: bool,
    ctx: &mut TrainContext,
) -> Tensor {
    let amount = if training {
        let amount = training_amount(config, ctx.step);
        ctx.metrics.update("expl_amount", amount);
        amount
    } else if config.eval_noise != 0.0 {
        config.eval_noise
    } else {
        return action.shallow_clone();
    };
    perturb(action, config.expl, amount)
}
