use super::distribution::Distribution;
use crate::config::Activation;
use tch::{nn, Tensor};

/// Latent features -> 64x64 image distribution with unit variance.
#[derive(Debug)]
pub struct ConvDecoder {
    linear: nn::Linear,
    deconvs: Vec<nn::ConvTranspose2D>,
    act: Activation,
    depth: i64,
    channels: i64,
}

impl ConvDecoder {
    pub fn new(p: &nn::Path, feat_size: i64, depth: i64, channels: i64, act: Activation) -> Self {
        let linear = nn::linear(p / "h1", feat_size, 32 * depth, Default::default());
        let layers = [
            (32 * depth, 4 * depth, 5),
            (4 * depth, 2 * depth, 5),
            (2 * depth, depth, 6),
            (depth, channels, 6),
        ];
        let deconvs = layers
            .iter()
            .enumerate()
            .map(|(i, &(c_in, c_out, k))| {
                nn::conv_transpose2d(
                    p / format!("h{}", i + 2),
                    c_in,
                    c_out,
                    k,
                    nn::ConvTransposeConfig {
                        stride: 2,
                        ..Default::default()
                    },
                )
            })
            .collect();

        Self {
            linear,
            deconvs,
            act,
            depth,
            channels,
        }
    }

    /// Input `[.., feat]`, output `Normal(mean [.., 64, 64, C], 1)`.
    pub fn forward(&self, features: &Tensor) -> Distribution {
        let size = features.size();
        let leading = &size[..size.len() - 1];
        let x = features
            .apply(&self.linear)
            .reshape([-1, 32 * self.depth, 1, 1]);
        let last = self.deconvs.len() - 1;
        let x = self
            .deconvs
            .iter()
            .enumerate()
            .fold(x, |x, (i, deconv)| {
                let x = x.apply(deconv);
                if i < last {
                    self.act.apply(&x)
                } else {
                    x
                }
            });
        let x = x.permute([0, 2, 3, 1]);
        let hwc = x.size()[1..].to_vec();
        let out: Vec<i64> = leading.iter().copied().chain(hwc).collect();
        let mean = x.reshape(out);
        Distribution::Normal {
            std: mean.ones_like(),
            mean,
            event_dims: 3,
        }
    }

    pub fn channels(&self) -> i64 {
        self.channels
    }
}

/// Output distribution of a dense head.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputKind {
    /// Unit-variance Gaussian
    Normal,
    /// Bernoulli over logits
    Binary,
}

/// Dense head for value, discriminator and continuation predictions.
#[derive(Debug)]
pub struct DenseDecoder {
    seq: nn::Sequential,
    kind: OutputKind,
}

impl DenseDecoder {
    pub fn new(
        p: &nn::Path,
        in_dim: i64,
        layers: i64,
        units: i64,
        kind: OutputKind,
        act: Activation,
    ) -> Self {
        let mut seq = nn::seq();
        let mut cur_in = in_dim;
        for i in 0..layers {
            seq = seq.add(nn::linear(
                p / format!("h{}", i),
                cur_in,
                units,
                Default::default(),
            ));
            seq = seq.add_fn(move |xs| act.apply(xs));
            cur_in = units;
        }
        seq = seq.add(nn::linear(p / "hout", cur_in, 1, Default::default()));

        Self { seq, kind }
    }

    /// Raw scalar output `[..]` (the logits for a binary head).
    pub fn logits(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.seq).squeeze_dim(-1)
    }

    pub fn forward(&self, xs: &Tensor) -> Distribution {
        self.distribution(self.logits(xs))
    }

    /// Distribution together with the raw output it was built from.
    pub fn forward_with_logits(&self, xs: &Tensor) -> (Distribution, Tensor) {
        let logits = self.logits(xs);
        (self.distribution(logits.shallow_clone()), logits)
    }

    fn distribution(&self, out: Tensor) -> Distribution {
        match self.kind {
            OutputKind::Normal => Distribution::Normal {
                std: out.ones_like(),
                mean: out,
                event_dims: 0,
            },
            OutputKind::Binary => Distribution::Bernoulli { logits: out },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn test_conv_decoder_produces_64px_frames() {
        let vs = nn::VarStore::new(Device::Cpu);
        let dec = ConvDecoder::new(&vs.root(), 10, 2, 3, Activation::Relu);
        let feat = Tensor::zeros([2, 3, 10], (Kind::Float, Device::Cpu));
        let dist = dec.forward(&feat);
        assert_eq!(dist.mean().size(), vec![2, 3, 64, 64, 3]);
        let target = Tensor::zeros([2, 3, 64, 64, 3], (Kind::Float, Device::Cpu));
        assert_eq!(dist.log_prob(&target).size(), vec![2, 3]);
    }

    #[test]
    fn test_dense_binary_head_returns_logits() {
        let vs = nn::VarStore::new(Device::Cpu);
        let head = DenseDecoder::new(&vs.root(), 6, 2, 8, OutputKind::Binary, Activation::Elu);
        let features = Tensor::ones([4, 6], (Kind::Float, Device::Cpu));
        let (dist, logits) = head.forward_with_logits(&features);
        assert_eq!(logits.size(), vec![4]);
        let p = dist.mean();
        assert!(p.min().double_value(&[]) > 0.0 && p.max().double_value(&[]) < 1.0);
    }

    #[test]
    fn test_dense_normal_head_mode_is_mean() {
        let vs = nn::VarStore::new(Device::Cpu);
        let head = DenseDecoder::new(&vs.root(), 6, 3, 8, OutputKind::Normal, Activation::Elu);
        let dist = head.forward(&Tensor::ones([2, 5, 6], (Kind::Float, Device::Cpu)));
        assert!(dist.mode().equal(&dist.mean()));
        assert_eq!(dist.mode().size(), vec![2, 5]);
    }
}
