use super::distribution::Distribution;
use crate::config::{ActionDist, Activation};
use tch::{nn, Tensor};

const MEAN_SCALE: f64 = 5.0;
const MIN_STD: f64 = 1e-4;
const DIST_SAMPLES: i64 = 100;

/// Stochastic policy head over latent features.
#[derive(Debug)]
pub struct ActionDecoder {
    seq: nn::Sequential,
    dist: ActionDist,
    action_dim: i64,
    raw_init_std: f64,
}

impl ActionDecoder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        p: &nn::Path,
        feat_size: i64,
        action_dim: i64,
        layers: i64,
        units: i64,
        dist: ActionDist,
        init_std: f64,
        act: Activation,
    ) -> Self {
        let mut seq = nn::seq();
        let mut cur_in = feat_size;
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
        let out_dim = match dist {
            ActionDist::TanhNormal => 2 * action_dim,
            ActionDist::Onehot => action_dim,
        };
        seq = seq.add(nn::linear(p / "hout", cur_in, out_dim, Default::default()));

        Self {
            seq,
            dist,
            action_dim,
            // Inverse softplus, so a zero pre-activation starts at `init_std`.
            raw_init_std: init_std.exp_m1().ln(),
        }
    }

    pub fn action_dim(&self) -> i64 {
        self.action_dim
    }

    pub fn forward(&self, features: &Tensor) -> Distribution {
        let x = features.apply(&self.seq);
        match self.dist {
            ActionDist::TanhNormal => {
                let chunks = x.chunk(2, -1);
                let mean = (&chunks[0] / MEAN_SCALE).tanh() * MEAN_SCALE;
                let std = (&chunks[1] + self.raw_init_std).softplus() + MIN_STD;
                Distribution::TanhNormal {
                    mean,
                    std,
                    samples: DIST_SAMPLES,
                }
            }
            ActionDist::Onehot => Distribution::OneHot { logits: x },
        }
    }
}
