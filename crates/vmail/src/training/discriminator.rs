//! Adversarial reward model losses.

use super::optimizer::{global_norm, ParamGroup};
use crate::model::{DenseDecoder, Distribution};
use crate::Result;
use tch::{Kind, Tensor};

/// Discriminator terms for one training step.
pub struct DiscriminatorLosses {
    /// Distribution over expert pairs `[B, T - 1]`
    pub expert: Distribution,
    /// Distribution over imagined pairs `[H, N]`; its mean is the reward
    pub policy: Distribution,
    /// `mean log p(1 | expert)`
    pub expert_term: Tensor,
    /// `mean log p(0 | policy)`
    pub policy_term: Tensor,
    pub penalty: Tensor,
    pub loss: Tensor,
}

/// `(‖g‖ - 1)²`
pub fn penalty_from_norm(norm: &Tensor) -> Tensor {
    (norm - 1.0).square()
}

/// One-centred gradient penalty.
///
/// Interpolates every imagined pair with the matching expert pair (the
/// flattened expert pairs are tiled across the horizon) using a uniform
/// per-pair coefficient, then penalises the distance from one of the norm of
/// the gradient of the mean logit with respect to the discriminator's
/// parameters. The returned tensor keeps its graph so the penalty itself can
/// be differentiated.
pub fn gradient_penalty(
    discriminator: &DenseDecoder,
    params: &ParamGroup,
    policy_pairs: &Tensor,
    expert_pairs: &Tensor,
) -> Result<Tensor> {
    let size = policy_pairs.size();
    let (horizon, seeds) = (size[0], size[1]);
    let alpha = Tensor::rand([horizon, seeds, 1], (Kind::Float, policy_pairs.device()));
    let expert = expert_pairs
        .flatten(0, -2)
        .unsqueeze(0)
        .repeat([horizon, 1, 1]);
    let mixed = &alpha * policy_pairs + (1.0 - &alpha) * expert;
    let logits = discriminator.logits(&mixed);
    let grads = params.gradients(&logits.mean(Kind::Float), true, true)?;
    Ok(penalty_from_norm(&global_norm(&grads)))
}

/// Expert term, policy term, penalty and the total loss
/// `-(expert_term + policy_term) + alpha * penalty`.
pub fn discriminator_losses(
    discriminator: &DenseDecoder,
    params: &ParamGroup,
    expert_pairs: &Tensor,
    policy_pairs: &Tensor,
    alpha: f64,
) -> Result<DiscriminatorLosses> {
    let expert = discriminator.forward(expert_pairs);
    let policy = discriminator.forward(policy_pairs);
    let expert_term = expert
        .log_prob(&expert.mean().detach().ones_like())
        .mean(Kind::Float);
    let policy_term = policy
        .log_prob(&policy.mean().detach().zeros_like())
        .mean(Kind::Float);

    let penalty = gradient_penalty(discriminator, params, policy_pairs, expert_pairs)?;
    let loss = -(&expert_term + &policy_term) + &penalty * alpha;

    Ok(DiscriminatorLosses {
        expert,
        policy,
        expert_term,
        policy_term,
        penalty,
        loss,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Activation;
    use crate::model::OutputKind;
    use tch::{nn, Device};

    #[test]
    fn test_penalty_is_zero_at_unit_norm() {
        let at_one = penalty_from_norm(&Tensor::from(1.0f32));
        assert_eq!(at_one.double_value(&[]), 0.0);
        let off = penalty_from_norm(&Tensor::from(3.0f32));
        assert_eq!(off.double_value(&[]), 4.0);
    }

    #[test]
    fn test_losses_are_finite_and_penalty_non_negative() {
        let vs = nn::VarStore::new(Device::Cpu);
        let disc = DenseDecoder::new(&vs.root(), 6, 2, 8, OutputKind::Binary, Activation::Elu);
        let params = ParamGroup::new("discriminator", &vs);

        // B = 2, T - 1 = 3 expert pairs; H = 4, N = 6 imagined pairs
        let expert = Tensor::randn([2, 3, 6], (Kind::Float, Device::Cpu));
        let policy = Tensor::randn([4, 6, 6], (Kind::Float, Device::Cpu));
        let out = discriminator_losses(&disc, &params, &expert, &policy, 1.0).unwrap();

        assert!(out.penalty.double_value(&[]) >= 0.0);
        assert!(out.loss.double_value(&[]).is_finite());
        assert!(out.expert_term.double_value(&[]) <= 0.0);
        assert_eq!(out.policy.mean().size(), vec![4, 6]);

        // the penalty is differentiable with respect to the parameters
        let grads = params.gradients(&out.loss, false, false).unwrap();
        assert_eq!(grads.len(), params.len());
    }
}
