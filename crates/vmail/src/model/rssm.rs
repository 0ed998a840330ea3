use super::distribution::Distribution;
use tch::{nn, nn::RNN, Device, Kind, Tensor};

/// Latent state of the dynamics model.
///
/// `mean` and `std` parametrise the diagonal Gaussian over the stochastic
/// component, `stoch` is a sample from it and `deter` is the recurrent
/// hidden state. Leading dimensions are shared by all four tensors.
#[derive(Debug)]
pub struct LatentState {
    pub mean: Tensor,  // [.., stoch_size]
    pub std: Tensor,   // [.., stoch_size]
    pub stoch: Tensor, // [.., stoch_size]
    pub deter: Tensor, // [.., deter_size]
}

impl Clone for LatentState {
    fn clone(&self) -> Self {
        Self {
            mean: self.mean.shallow_clone(),
            std: self.std.shallow_clone(),
            stoch: self.stoch.shallow_clone(),
            deter: self.deter.shallow_clone(),
        }
    }
}

impl LatentState {
    fn map(&self, f: impl Fn(&Tensor) -> Tensor) -> Self {
        Self {
            mean: f(&self.mean),
            std: f(&self.std),
            stoch: f(&self.stoch),
            deter: f(&self.deter),
        }
    }

    /// Stack a sequence of states along a new dimension.
    pub fn stack(states: &[LatentState], dim: i64) -> Self {
        let field = |get: fn(&LatentState) -> &Tensor| {
            Tensor::stack(&states.iter().map(get).collect::<Vec<_>>(), dim)
        };
        Self {
            mean: field(|s| &s.mean),
            std: field(|s| &s.std),
            stoch: field(|s| &s.stoch),
            deter: field(|s| &s.deter),
        }
    }

    pub fn detach(&self) -> Self {
        self.map(|t| t.detach())
    }

    /// Drop the last step of a `[B, T, ..]` sequence.
    pub fn drop_last_step(&self) -> Self {
        self.map(|t| {
            let steps = t.size()[1];
            t.narrow(1, 0, steps - 1)
        })
    }

    /// Collapse the leading `[B, T]` dimensions into one.
    pub fn flatten_batch(&self) -> Self {
        self.map(|t| t.flatten(0, 1))
    }

    /// Multiply every component by a `[B]` mask, zeroing entries whose
    /// episode has just been reset.
    pub fn masked(&self, keep: &Tensor) -> Self {
        let mask = keep.unsqueeze(-1);
        self.map(|t| t * &mask)
    }
}

/// Recurrent state-space model with a Gaussian stochastic latent.
#[derive(Debug)]
pub struct Rssm {
    stoch_size: i64,
    deter_size: i64,
    img_in: nn::Linear,
    cell: nn::GRU,
    img_out: nn::Linear,
    img_stats: nn::Linear,
    obs_out: nn::Linear,
    obs_stats: nn::Linear,
}

impl Rssm {
    pub fn new(
        p: &nn::Path,
        stoch_size: i64,
        deter_size: i64,
        hidden_size: i64,
        action_dim: i64,
        embed_size: i64,
    ) -> Self {
        let img_in = nn::linear(
            p / "img_in",
            stoch_size + action_dim,
            hidden_size,
            Default::default(),
        );
        let cell = nn::gru(p / "cell", hidden_size, deter_size, Default::default());
        let img_out = nn::linear(p / "img_out", deter_size, hidden_size, Default::default());
        let img_stats = nn::linear(
            p / "img_stats",
            hidden_size,
            2 * stoch_size,
            Default::default(),
        );
        let obs_out = nn::linear(
            p / "obs_out",
            deter_size + embed_size,
            hidden_size,
            Default::default(),
        );
        let obs_stats = nn::linear(
            p / "obs_stats",
            hidden_size,
            2 * stoch_size,
            Default::default(),
        );

        Self {
            stoch_size,
            deter_size,
            img_in,
            cell,
            img_out,
            img_stats,
            obs_out,
            obs_stats,
        }
    }

    pub fn stoch_size(&self) -> i64 {
        self.stoch_size
    }

    pub fn deter_size(&self) -> i64 {
        self.deter_size
    }

    /// Cold-start state: mean 0, std 1, stoch 0, deter 0.
    pub fn initialize(&self, batch_size: i64, device: Device) -> LatentState {
        let opts = (Kind::Float, device);
        LatentState {
            mean: Tensor::zeros([batch_size, self.stoch_size], opts),
            std: Tensor::ones([batch_size, self.stoch_size], opts),
            stoch: Tensor::zeros([batch_size, self.stoch_size], opts),
            deter: Tensor::zeros([batch_size, self.deter_size], opts),
        }
    }

    /// Prior step: advance `deter` from `(prev.stoch, action)` and derive the
    /// stochastic parameters from `deter` alone.
    pub fn img_step(&self, prev: &LatentState, action: &Tensor) -> LatentState {
        let x = Tensor::cat(&[&prev.stoch, action], -1)
            .apply(&self.img_in)
            .elu();
        let deter = self
            .cell
            .step(&x, &nn::GRUState(prev.deter.unsqueeze(0)))
            .0
            .squeeze_dim(0);
        let stats = deter.apply(&self.img_out).elu().apply(&self.img_stats);
        self.sample_state(&stats, deter)
    }

    /// Posterior step. Returns `(posterior, prior)`; both share the same
    /// deterministic transition, only the posterior reads the embedding.
    pub fn obs_step(
        &self,
        prev: &LatentState,
        prev_action: &Tensor,
        embed: &Tensor,
    ) -> (LatentState, LatentState) {
        let prior = self.img_step(prev, prev_action);
        let stats = Tensor::cat(&[&prior.deter, embed], -1)
            .apply(&self.obs_out)
            .elu()
            .apply(&self.obs_stats);
        let post = self.sample_state(&stats, prior.deter.shallow_clone());
        (post, prior)
    }

    /// Scan `obs_step` over `embed: [B, T, E]` and `action: [B, T, A]`.
    /// Returns posterior and prior sequences shaped `[B, T, ..]`.
    pub fn observe(
        &self,
        embed: &Tensor,
        action: &Tensor,
        state: Option<LatentState>,
    ) -> (LatentState, LatentState) {
        let (batch, steps) = (embed.size()[0], embed.size()[1]);
        let init = state.unwrap_or_else(|| self.initialize(batch, embed.device()));
        let (_, posts, priors) = (0..steps).fold(
            (init, Vec::new(), Vec::new()),
            |(prev, mut posts, mut priors), t| {
                let (post, prior) =
                    self.obs_step(&prev, &action.select(1, t), &embed.select(1, t));
                posts.push(post.clone());
                priors.push(prior);
                (post, posts, priors)
            },
        );
        (LatentState::stack(&posts, 1), LatentState::stack(&priors, 1))
    }

    /// Scan `img_step` over `action: [B, T, A]` starting from `state`.
    pub fn imagine(&self, action: &Tensor, state: Option<LatentState>) -> LatentState {
        let (batch, steps) = (action.size()[0], action.size()[1]);
        let init = state.unwrap_or_else(|| self.initialize(batch, action.device()));
        let (_, priors) = (0..steps).fold((init, Vec::new()), |(prev, mut priors), t| {
            let prior = self.img_step(&prev, &action.select(1, t));
            priors.push(prior.clone());
            (prior, priors)
        });
        LatentState::stack(&priors, 1)
    }

    /// Feature vector `concat(stoch, deter)`.
    pub fn get_feat(&self, state: &LatentState) -> Tensor {
        Tensor::cat(&[&state.stoch, &state.deter], -1)
    }

    pub fn get_distribution(&self, state: &LatentState) -> Distribution {
        Distribution::Normal {
            mean: state.mean.shallow_clone(),
            std: state.std.shallow_clone(),
            event_dims: 1,
        }
    }

    fn sample_state(&self, stats: &Tensor, deter: Tensor) -> LatentState {
        let chunks = stats.chunk(2, -1);
        let mean = chunks[0].shallow_clone();
        let std = chunks[1].softplus() + 0.1;
        let stoch = &mean + &std * mean.randn_like();
        LatentState {
            mean,
            std,
            stoch,
            deter,
        }
    }
}
