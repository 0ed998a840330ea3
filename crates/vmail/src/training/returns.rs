//! Return estimates over imagined trajectories.

use tch::{Kind, Tensor};

/// Lambda-return along the leading (time) axis.
///
/// `return_t = reward_t + pcont_t * ((1 - λ) * value_{t+1} + λ * return_{t+1})`
/// with `value_T` and `return_T` both equal to `bootstrap` (zeros when
/// absent). With `λ = 1` this is the discounted sum of rewards plus the
/// discounted bootstrap.
pub fn lambda_return(
    reward: &Tensor,
    value: &Tensor,
    pcont: &Tensor,
    bootstrap: Option<&Tensor>,
    lambda: f64,
) -> Tensor {
    let steps = reward.size()[0];
    let bootstrap = match bootstrap {
        Some(b) => b.shallow_clone(),
        None => value.get(0).zeros_like(),
    };
    let next_values = Tensor::cat(&[value.narrow(0, 1, steps - 1), bootstrap.unsqueeze(0)], 0);
    let inputs = reward + pcont * &next_values * (1.0 - lambda);

    let (_, mut returns) = (0..steps).rev().fold(
        (bootstrap, Vec::with_capacity(steps as usize)),
        |(last, mut acc), t| {
            let ret = inputs.get(t) + pcont.get(t) * lambda * last;
            acc.push(ret.shallow_clone());
            (ret, acc)
        },
    );
    returns.reverse();
    Tensor::stack(&returns, 0)
}

/// Loss weights for imagined steps: cumulative product of `pcont` with the
/// first weight fixed at one. Gradients are stopped.
///
/// Takes `pcont: [H, ..]` and returns `[H - 1, ..]`, matching returns
/// computed from `pcont[:-1]`.
pub fn discount_weights(pcont: &Tensor) -> Tensor {
    let steps = pcont.size()[0];
    let first = pcont.narrow(0, 0, 1).ones_like();
    Tensor::cat(&[first, pcont.narrow(0, 0, steps - 2)], 0)
        .cumprod(0, Kind::Float)
        .detach()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn column(values: &[f32]) -> Tensor {
        Tensor::from_slice(values).view([-1, 1])
    }

    #[test]
    fn test_lambda_one_is_discounted_sum() {
        let reward = column(&[1.0, 1.0, 1.0]);
        let value = column(&[5.0, 7.0, 11.0]);
        let pcont = column(&[0.9, 0.9, 0.9]);
        let returns = lambda_return(&reward, &value, &pcont, None, 1.0);
        assert!((returns.double_value(&[0, 0]) - 2.71).abs() < 1e-5);
        assert!((returns.double_value(&[1, 0]) - 1.9).abs() < 1e-5);
        assert!((returns.double_value(&[2, 0]) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_bootstrap_is_discounted_into_return() {
        let reward = column(&[1.0, 1.0, 1.0]);
        let value = column(&[0.0, 0.0, 0.0]);
        let pcont = column(&[0.9, 0.9, 0.9]);
        let bootstrap = Tensor::from_slice(&[10.0f32]);
        let returns = lambda_return(&reward, &value, &pcont, Some(&bootstrap), 1.0);
        let expected = 2.71 + 0.9f64.powi(3) * 10.0;
        assert!((returns.double_value(&[0, 0]) - expected).abs() < 1e-4);
    }

    #[test]
    fn test_lambda_zero_is_one_step_td() {
        let reward = column(&[1.0, 2.0]);
        let value = column(&[3.0, 4.0]);
        let pcont = column(&[0.5, 0.5]);
        let returns = lambda_return(&reward, &value, &pcont, None, 0.0);
        // r_0 + γ v_1 and r_1 + γ * 0
        assert!((returns.double_value(&[0, 0]) - 3.0).abs() < 1e-6);
        assert!((returns.double_value(&[1, 0]) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_discount_weights() {
        let pcont = Tensor::full([4, 2], 0.5, (Kind::Float, Device::Cpu));
        let weights = discount_weights(&pcont);
        assert_eq!(weights.size(), vec![3, 2]);
        assert_eq!(weights.double_value(&[0, 0]), 1.0);
        assert_eq!(weights.double_value(&[1, 1]), 0.5);
        assert_eq!(weights.double_value(&[2, 0]), 0.25);
        assert!(!weights.requires_grad());
    }
}
