//! Latent rollouts driven by the actor, with no real observations.

use crate::model::{ActionDecoder, LatentState, Rssm};
use tch::Tensor;

/// Imagined trajectories seeded from every `(batch, time)` posterior.
pub struct Imagination {
    /// `[H + 1, N, feat]`, seed state first
    pub features: Tensor,
    /// `[H, N, action]`
    pub actions: Tensor,
}

/// Roll the actor and the prior forward `horizon` steps.
///
/// The final step of `post: [B, T, ..]` is dropped (no action follows it)
/// and the rest flattened into `N = B * (T - 1)` seeds. The actor sees
/// detached features, so its gradients reach the returns only through the
/// sampled actions.
pub fn imagine_ahead(
    rssm: &Rssm,
    actor: &ActionDecoder,
    post: &LatentState,
    horizon: i64,
) -> Imagination {
    let start = post.drop_last_step().flatten_batch();
    let init_feat = rssm.get_feat(&start);
    let (_, features, actions) = (0..horizon).fold(
        (start, vec![init_feat], Vec::with_capacity(horizon as usize)),
        |(state, mut features, mut actions), _| {
            let action = actor.forward(&rssm.get_feat(&state).detach()).sample();
            let next = rssm.img_step(&state, &action);
            features.push(rssm.get_feat(&next));
            actions.push(action);
            (next, features, actions)
        },
    );
    Imagination {
        features: Tensor::stack(&features, 0),
        actions: Tensor::stack(&actions, 0),
    }
}
