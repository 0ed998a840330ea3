use crate::config::Activation;
use tch::{nn, Tensor};

const KERNEL: i64 = 4;
const STRIDE: i64 = 2;

/// CNN encoder: image (with optional depth channel) -> embedding.
#[derive(Debug)]
pub struct ConvEncoder {
    convs: Vec<nn::Conv2D>,
    act: Activation,
    output_size: i64,
}

impl ConvEncoder {
    pub fn new(
        p: &nn::Path,
        in_channels: i64,
        depth: i64,
        image_size: [i64; 2],
        act: Activation,
    ) -> Self {
        let channels = [depth, 2 * depth, 4 * depth, 8 * depth];
        let cfg = nn::ConvConfig {
            stride: STRIDE,
            ..Default::default()
        };
        let mut c_in = in_channels;
        let mut convs = Vec::with_capacity(channels.len());
        for (i, &c_out) in channels.iter().enumerate() {
            convs.push(nn::conv2d(p / format!("h{}", i + 1), c_in, c_out, KERNEL, cfg));
            c_in = c_out;
        }

        Self {
            convs,
            act,
            output_size: Self::output_size(depth, image_size),
        }
    }

    /// Embedding width for a given channel depth and image size.
    pub fn output_size(depth: i64, image_size: [i64; 2]) -> i64 {
        let shrink = |s: i64| (0..4).fold(s, |s, _| (s - KERNEL) / STRIDE + 1);
        8 * depth * shrink(image_size[0]) * shrink(image_size[1])
    }

    pub fn embed_size(&self) -> i64 {
        self.output_size
    }

    /// Input: `[.., H, W, C]` preprocessed pixels. Output: `[.., embed]`.
    pub fn forward(&self, image: &Tensor) -> Tensor {
        let size = image.size();
        let rank = size.len();
        let leading = &size[..rank - 3];
        let x = image
            .reshape([-1, size[rank - 3], size[rank - 2], size[rank - 1]])
            .permute([0, 3, 1, 2]);
        let x = self
            .convs
            .iter()
            .fold(x, |x, conv| self.act.apply(&x.apply(conv)));
        let out: Vec<i64> = leading.iter().copied().chain([self.output_size]).collect();
        x.reshape(out)
    }
}

/// Dense encoder for proprioceptive vectors.
#[derive(Debug)]
pub struct DenseEncoder {
    seq: nn::Sequential,
    out_units: i64,
}

impl DenseEncoder {
    pub fn new(
        p: &nn::Path,
        in_dim: i64,
        layers: i64,
        hidden_units: i64,
        out_units: i64,
        act: Activation,
    ) -> Self {
        let mut seq = nn::seq();
        let mut cur_in = in_dim;
        for i in 0..layers {
            seq = seq.add(nn::linear(
                p / format!("h{}", i),
                cur_in,
                hidden_units,
                Default::default(),
            ));
            seq = seq.add_fn(move |xs| act.apply(xs));
            cur_in = hidden_units;
        }
        seq = seq.add(nn::linear(p / "out", cur_in, out_units, Default::default()));

        Self { seq, out_units }
    }

    pub fn embed_size(&self) -> i64 {
        self.out_units
    }

    pub fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn test_conv_output_size_for_64px() {
        assert_eq!(ConvEncoder::output_size(32, [64, 64]), 1024);
        assert_eq!(ConvEncoder::output_size(4, [64, 64]), 128);
    }

    #[test]
    fn test_conv_encoder_keeps_leading_dims() {
        let vs = nn::VarStore::new(Device::Cpu);
        let enc = ConvEncoder::new(&vs.root(), 3, 2, [64, 64], Activation::Relu);
        let image = Tensor::zeros([2, 3, 64, 64, 3], (Kind::Float, Device::Cpu));
        let out = enc.forward(&image);
        assert_eq!(out.size(), vec![2, 3, enc.embed_size()]);
    }

    #[test]
    fn test_dense_encoder_without_hidden_layers() {
        let vs = nn::VarStore::new(Device::Cpu);
        let enc = DenseEncoder::new(&vs.root(), 4, 0, 16, 8, Activation::Elu);
        let out = enc.forward(&Tensor::ones([5, 4], (Kind::Float, Device::Cpu)));
        assert_eq!(out.size(), vec![5, 8]);
        assert_eq!(vs.trainable_variables().len(), 2);
    }
}
