//! Probability distributions produced by the network heads.

use tch::{Kind, Tensor};

const HALF_LOG_2PI: f64 = 0.918_938_533_204_672_8;

/// Output distribution of a network head.
///
/// Every variant holds tensors whose leading dimensions are the batch shape.
/// `Normal` reduces its trailing `event_dims` dimensions in `log_prob` and
/// `entropy`; the remaining variants treat the last dimension as the event.
pub enum Distribution {
    /// Diagonal Gaussian, reparameterised
    Normal {
        mean: Tensor,
        std: Tensor,
        event_dims: usize,
    },
    /// Scalar Bernoulli over logits
    Bernoulli { logits: Tensor },
    /// Gaussian squashed by `tanh`; mode and entropy are estimated from samples
    TanhNormal {
        mean: Tensor,
        std: Tensor,
        samples: i64,
    },
    /// One-hot categorical with straight-through gradients
    OneHot { logits: Tensor },
}

fn sum_last(xs: &Tensor, dims: usize) -> Tensor {
    if dims == 0 {
        return xs.shallow_clone();
    }
    let rank = xs.dim() as i64;
    let axes: Vec<i64> = (rank - dims as i64..rank).collect();
    xs.sum_dim_intlist(axes.as_slice(), false, Kind::Float)
}

fn normal_log_prob(mean: &Tensor, std: &Tensor, x: &Tensor) -> Tensor {
    let z = (x - mean) / std;
    z.square() * -0.5 - std.log() - HALF_LOG_2PI
}

/// `log(1 - tanh(u)^2)` evaluated without cancellation.
fn tanh_log_det(pre_tanh: &Tensor) -> Tensor {
    ((-pre_tanh * 2.0).softplus() + pre_tanh - std::f64::consts::LN_2) * -2.0
}

impl Distribution {
    /// Draw a sample. Gradients flow through `Normal`, `TanhNormal` and
    /// (straight-through) `OneHot` samples.
    pub fn sample(&self) -> Tensor {
        match self {
            Distribution::Normal { mean, std, .. } => mean + std * mean.randn_like(),
            Distribution::Bernoulli { logits } => logits.sigmoid().detach().bernoulli(),
            Distribution::TanhNormal { mean, std, .. } => (mean + std * mean.randn_like()).tanh(),
            Distribution::OneHot { logits } => {
                let probs = logits.softmax(-1, Kind::Float);
                let classes = logits.size()[logits.dim() - 1];
                let flat = probs.detach().reshape([-1, classes]);
                let indices = flat.multinomial(1, true).squeeze_dim(-1);
                let hard = indices
                    .one_hot(classes)
                    .to_kind(Kind::Float)
                    .reshape(probs.size());
                &hard + &probs - probs.detach()
            }
        }
    }

    /// Most likely value.
    pub fn mode(&self) -> Tensor {
        match self {
            Distribution::Normal { mean, .. } => mean.shallow_clone(),
            Distribution::Bernoulli { logits } => logits.ge(0.0).to_kind(Kind::Float),
            Distribution::TanhNormal { mean, std, samples } => {
                let (pre_tanh, log_prob) = self.tanh_samples(mean, std, *samples);
                let actions = pre_tanh.tanh();
                let size = actions.size();
                let dim = size[size.len() - 1];
                let flat = actions.reshape([*samples, -1, dim]);
                let best = log_prob.reshape([*samples, -1]).argmax(0, false);
                let index = best.view([1, -1, 1]).expand([1, -1, dim], false);
                flat.gather(0, &index, false)
                    .squeeze_dim(0)
                    .reshape(&size[1..])
            }
            Distribution::OneHot { logits } => {
                let probs = logits.softmax(-1, Kind::Float);
                let classes = logits.size()[logits.dim() - 1];
                let hard = logits.argmax(-1, false).one_hot(classes).to_kind(Kind::Float);
                &hard + &probs - probs.detach()
            }
        }
    }

    /// Expected value.
    pub fn mean(&self) -> Tensor {
        match self {
            Distribution::Normal { mean, .. } => mean.shallow_clone(),
            Distribution::Bernoulli { logits } => logits.sigmoid(),
            Distribution::TanhNormal { mean, std, samples } => {
                let noise = Tensor::randn(
                    [[*samples].as_slice(), mean.size().as_slice()].concat(),
                    (mean.kind(), mean.device()),
                );
                (mean + std * noise).tanh().mean_dim([0i64].as_slice(), false, Kind::Float)
            }
            Distribution::OneHot { logits } => logits.softmax(-1, Kind::Float),
        }
    }

    pub fn log_prob(&self, x: &Tensor) -> Tensor {
        match self {
            Distribution::Normal {
                mean,
                std,
                event_dims,
            } => sum_last(&normal_log_prob(mean, std, x), *event_dims),
            Distribution::Bernoulli { logits } => {
                x * logits.log_sigmoid() + (1.0 - x) * (-logits).log_sigmoid()
            }
            Distribution::TanhNormal { mean, std, .. } => {
                let clipped = x.clamp(-1.0 + 1e-6, 1.0 - 1e-6);
                let pre_tanh = ((1.0f64 + &clipped) / (1.0f64 - &clipped)).log() * 0.5;
                let log_prob = normal_log_prob(mean, std, &pre_tanh) - tanh_log_det(&pre_tanh);
                sum_last(&log_prob, 1)
            }
            Distribution::OneHot { logits } => {
                sum_last(&(x * logits.log_softmax(-1, Kind::Float)), 1)
            }
        }
    }

    pub fn entropy(&self) -> Tensor {
        match self {
            Distribution::Normal {
                std, event_dims, ..
            } => sum_last(&(std.log() + 0.5 + HALF_LOG_2PI), *event_dims),
            Distribution::Bernoulli { logits } => {
                let p = logits.sigmoid();
                -(&p * logits.log_sigmoid() + (1.0f64 - &p) * (-logits).log_sigmoid())
            }
            Distribution::TanhNormal { mean, std, samples } => {
                let (_, log_prob) = self.tanh_samples(mean, std, *samples);
                -log_prob.mean_dim([0i64].as_slice(), false, Kind::Float)
            }
            Distribution::OneHot { logits } => {
                let log_probs = logits.log_softmax(-1, Kind::Float);
                -sum_last(&(log_probs.exp() * &log_probs), 1)
            }
        }
    }

    /// Draws `samples` pre-tanh values and their log-probabilities after squashing.
    fn tanh_samples(&self, mean: &Tensor, std: &Tensor, samples: i64) -> (Tensor, Tensor) {
        let noise = Tensor::randn(
            [[samples].as_slice(), mean.size().as_slice()].concat(),
            (mean.kind(), mean.device()),
        );
        let pre_tanh = mean + std * noise;
        let log_prob = normal_log_prob(mean, std, &pre_tanh) - tanh_log_det(&pre_tanh);
        (pre_tanh, sum_last(&log_prob, 1))
    }
}

/// KL divergence between two diagonal Gaussians with matching event rank.
pub fn kl_divergence(p: &Distribution, q: &Distribution) -> Option<Tensor> {
    match (p, q) {
        (
            Distribution::Normal {
                mean: mp,
                std: sp,
                event_dims,
            },
            Distribution::Normal {
                mean: mq, std: sq, ..
            },
        ) => {
            let var_ratio = (sp / sq).square();
            let mean_term = ((mp - mq) / sq).square();
            let kl = (&var_ratio + mean_term - 1.0 - var_ratio.log()) * 0.5;
            Some(sum_last(&kl, *event_dims))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn unit_normal(shape: &[i64]) -> Distribution {
        Distribution::Normal {
            mean: Tensor::zeros(shape, (Kind::Float, Device::Cpu)),
            std: Tensor::ones(shape, (Kind::Float, Device::Cpu)),
            event_dims: 1,
        }
    }

    #[test]
    fn test_normal_log_prob_and_entropy() {
        let dist = unit_normal(&[1, 1]);
        let x = Tensor::zeros([1, 1], (Kind::Float, Device::Cpu));
        let log_prob = dist.log_prob(&x).double_value(&[0]);
        assert!((log_prob + 0.9189).abs() < 1e-4);
        let entropy = dist.entropy().double_value(&[0]);
        assert!((entropy - 1.4189).abs() < 1e-4);
    }

    #[test]
    fn test_normal_event_rank_reduces_trailing_dims() {
        let dist = Distribution::Normal {
            mean: Tensor::zeros([2, 4, 4, 3], (Kind::Float, Device::Cpu)),
            std: Tensor::ones([2, 4, 4, 3], (Kind::Float, Device::Cpu)),
            event_dims: 3,
        };
        let x = Tensor::zeros([2, 4, 4, 3], (Kind::Float, Device::Cpu));
        assert_eq!(dist.log_prob(&x).size(), vec![2]);
    }

    #[test]
    fn test_kl_of_identical_normals_is_zero() {
        let kl = kl_divergence(&unit_normal(&[3, 5]), &unit_normal(&[3, 5])).unwrap();
        assert_eq!(kl.size(), vec![3]);
        assert!(kl.abs().max().double_value(&[]) < 1e-6);
    }

    #[test]
    fn test_kl_matches_closed_form() {
        let p = Distribution::Normal {
            mean: Tensor::from_slice(&[1.0f32]).view([1, 1]),
            std: Tensor::from_slice(&[1.0f32]).view([1, 1]),
            event_dims: 1,
        };
        let q = unit_normal(&[1, 1]);
        let kl = kl_divergence(&p, &q).unwrap().double_value(&[0]);
        assert!((kl - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_bernoulli_log_prob() {
        let dist = Distribution::Bernoulli {
            logits: Tensor::zeros([4], (Kind::Float, Device::Cpu)),
        };
        let ones = Tensor::ones([4], (Kind::Float, Device::Cpu));
        let log_prob = dist.log_prob(&ones);
        assert!((log_prob.double_value(&[0]) - 0.5f64.ln()).abs() < 1e-5);
        assert!((dist.mean().double_value(&[2]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_tanh_normal_stays_in_range() {
        tch::manual_seed(0);
        let dist = Distribution::TanhNormal {
            mean: Tensor::zeros([6, 2], (Kind::Float, Device::Cpu)),
            std: Tensor::ones([6, 2], (Kind::Float, Device::Cpu)) * 3.0,
            samples: 100,
        };
        let sample = dist.sample();
        assert_eq!(sample.size(), vec![6, 2]);
        assert!(sample.abs().max().double_value(&[]) <= 1.0);
        assert_eq!(dist.mode().size(), vec![6, 2]);
        assert_eq!(dist.entropy().size(), vec![6]);
    }

    #[test]
    fn test_onehot_sample_is_one_hot() {
        tch::manual_seed(0);
        let dist = Distribution::OneHot {
            logits: Tensor::randn([5, 3], (Kind::Float, Device::Cpu)),
        };
        let sample = dist.sample();
        let sums = sample.sum_dim_intlist([-1i64].as_slice(), false, Kind::Float);
        assert!((sums - 1.0).abs().max().double_value(&[]) < 1e-5);
        assert!(dist.entropy().min().double_value(&[]) >= 0.0);
    }
}
