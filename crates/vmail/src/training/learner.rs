//! The joint training step: world model, discriminator, actor and value.

use super::discriminator::discriminator_losses;
use super::distributed::ReplicaBackend;
use super::imagine::imagine_ahead;
use super::metrics::TrainContext;
use super::optimizer::{ModuleOptimizer, OptimizerSettings};
use super::returns::{discount_weights, lambda_return};
use crate::checkpoint::Checkpointable;
use crate::config::{Precision, VmailConfig};
use crate::data::Batch;
use crate::model::{
    kl_divergence, ActionDecoder, DenseDecoder, Distribution, LatentState, OutputKind, WorldModel,
};
use crate::{Result, VmailError};
use tch::{nn, Device, Kind, Tensor};

/// Losses and pre-clipping gradient norms of one training step.
#[derive(Clone, Debug, Default)]
pub struct TrainOutput {
    pub model_loss: f64,
    pub discriminator_loss: f64,
    pub actor_loss: f64,
    pub value_loss: f64,
    pub model_norm: f64,
    pub discriminator_norm: f64,
    pub actor_norm: f64,
    pub value_norm: f64,
}

impl TrainOutput {
    pub fn is_finite(&self) -> bool {
        [
            self.model_loss,
            self.discriminator_loss,
            self.actor_loss,
            self.value_loss,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

/// Tensors recorded while computing the four losses of one step.
struct StepGraph {
    model_loss: Tensor,
    discriminator_loss: Tensor,
    actor_loss: Tensor,
    value_loss: Tensor,
    post: LatentState,
    prior: LatentState,
    div: Tensor,
    image_like: Tensor,
    pcont_like: Option<Tensor>,
    expert_d: Tensor,
    policy_d: Tensor,
    expert_term: Tensor,
    policy_term: Tensor,
    penalty: Tensor,
    reward: Tensor,
}

/// One replica's networks and optimizers.
///
/// Parameters live in four `VarStore`s, one per optimizer:
/// `model` (encoders, RSSM, image decoder, continuation head),
/// `discriminator`, `value` and `actor`.
pub struct Learner {
    config: VmailConfig,
    precision: Precision,
    action_dim: i64,
    model_vs: nn::VarStore,
    discriminator_vs: nn::VarStore,
    value_vs: nn::VarStore,
    actor_vs: nn::VarStore,
    world: WorldModel,
    discriminator: DenseDecoder,
    value: DenseDecoder,
    actor: ActionDecoder,
    model_opt: ModuleOptimizer,
    discriminator_opt: ModuleOptimizer,
    value_opt: ModuleOptimizer,
    actor_opt: ModuleOptimizer,
    backend: Box<dyn ReplicaBackend>,
}

impl Learner {
    /// Build every network and optimizer, then take rank 0's parameters.
    pub fn new(
        config: &VmailConfig,
        action_dim: i64,
        proprio_dim: Option<i64>,
        backend: Box<dyn ReplicaBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let precision = config.precision()?;
        let device = config.device;
        let feat_size = config.feature_size();

        let model_vs = nn::VarStore::new(device);
        let discriminator_vs = nn::VarStore::new(device);
        let value_vs = nn::VarStore::new(device);
        let actor_vs = nn::VarStore::new(device);

        let world = WorldModel::new(&model_vs.root(), config, action_dim, proprio_dim)?;
        let discriminator = DenseDecoder::new(
            &discriminator_vs.root(),
            feat_size + action_dim,
            config.discriminator_layers,
            config.num_units,
            OutputKind::Binary,
            config.dense_act,
        );
        let value = DenseDecoder::new(
            &value_vs.root(),
            feat_size,
            config.value_layers,
            config.num_units,
            OutputKind::Normal,
            config.dense_act,
        );
        let actor = ActionDecoder::new(
            &actor_vs.root(),
            feat_size,
            action_dim,
            config.actor_layers,
            config.num_units,
            config.action_dist,
            config.action_init_std,
            config.dense_act,
        );

        let settings = OptimizerSettings {
            grad_clip: config.grad_clip,
            weight_decay: config.weight_decay,
            weight_decay_pattern: config.weight_decay_pattern.clone(),
            eps: config.adam_eps,
            loss_scaling: precision == Precision::Half,
        };
        let model_opt = ModuleOptimizer::new("model", &model_vs, config.model_lr, &settings)?;
        let discriminator_opt = ModuleOptimizer::new(
            "discriminator",
            &discriminator_vs,
            config.discriminator_lr,
            &settings,
        )?;
        let value_opt = ModuleOptimizer::new("value", &value_vs, config.value_lr, &settings)?;
        let actor_opt = ModuleOptimizer::new("actor", &actor_vs, config.actor_lr, &settings)?;

        let learner = Self {
            config: config.clone(),
            precision,
            action_dim,
            model_vs,
            discriminator_vs,
            value_vs,
            actor_vs,
            world,
            discriminator,
            value,
            actor,
            model_opt,
            discriminator_opt,
            value_opt,
            actor_opt,
            backend,
        };
        learner.synchronize()?;
        tracing::debug!(
            rank = learner.backend.rank(),
            model_params = learner.model_opt.group().len(),
            "learner ready"
        );
        Ok(learner)
    }

    pub fn action_dim(&self) -> i64 {
        self.action_dim
    }

    pub fn device(&self) -> Device {
        self.config.device
    }

    pub fn world(&self) -> &WorldModel {
        &self.world
    }

    pub fn actor(&self) -> &ActionDecoder {
        &self.actor
    }

    pub fn is_leader(&self) -> bool {
        self.backend.is_leader()
    }

    pub fn rank(&self) -> usize {
        self.backend.rank()
    }

    fn optimizers(&self) -> [&ModuleOptimizer; 4] {
        [
            &self.model_opt,
            &self.discriminator_opt,
            &self.value_opt,
            &self.actor_opt,
        ]
    }

    fn optimizers_mut(&mut self) -> [&mut ModuleOptimizer; 4] {
        [
            &mut self.model_opt,
            &mut self.discriminator_opt,
            &mut self.value_opt,
            &mut self.actor_opt,
        ]
    }

    /// Copy rank 0's parameters and optimizer moments into every replica.
    /// All replicas must call this together.
    pub fn synchronize(&self) -> Result<()> {
        if self.backend.world_size() <= 1 {
            return Ok(());
        }
        for opt in self.optimizers() {
            self.backend.broadcast(&opt.group().tensors())?;
        }
        Ok(())
    }

    /// Broadcast optimizer moments as well as parameters; used after a
    /// checkpoint restore on rank 0.
    pub fn synchronize_all(&mut self) -> Result<()> {
        self.synchronize()?;
        if self.backend.world_size() <= 1 {
            return Ok(());
        }
        let backend = &self.backend;
        for opt in [
            &mut self.model_opt,
            &mut self.discriminator_opt,
            &mut self.value_opt,
            &mut self.actor_opt,
        ] {
            let state = opt.state();
            let tensors: Vec<Tensor> = state.iter().map(|(_, t)| t.shallow_clone()).collect();
            backend.broadcast(&tensors)?;
            opt.load_state(&state)?;
        }
        Ok(())
    }

    /// One training step on a model batch and an expert batch.
    ///
    /// All four gradients are taken from the recorded graphs before any
    /// parameter changes; then each group is reduced across replicas,
    /// clipped and updated. The step counter in `ctx` is left untouched.
    pub fn train_step(
        &mut self,
        model: &Batch,
        expert: &Batch,
        ctx: &mut TrainContext,
    ) -> Result<TrainOutput> {
        let half = self.precision == Precision::Half;
        let graph = tch::autocast(half, || self.compute_losses(model, expert))?;

        let model_grads = self.model_opt.compute_gradients(&graph.model_loss, true)?;
        let discriminator_grads = self
            .discriminator_opt
            .compute_gradients(&graph.discriminator_loss, true)?;
        let actor_grads = self.actor_opt.compute_gradients(&graph.actor_loss, true)?;
        let value_grads = self.value_opt.compute_gradients(&graph.value_loss, true)?;

        let backend = self.backend.as_ref();
        let output = TrainOutput {
            model_loss: graph.model_loss.double_value(&[]),
            discriminator_loss: graph.discriminator_loss.double_value(&[]),
            actor_loss: graph.actor_loss.double_value(&[]),
            value_loss: graph.value_loss.double_value(&[]),
            model_norm: self.model_opt.apply(model_grads, backend)?,
            discriminator_norm: self.discriminator_opt.apply(discriminator_grads, backend)?,
            actor_norm: self.actor_opt.apply(actor_grads, backend)?,
            value_norm: self.value_opt.apply(value_grads, backend)?,
        };

        if self.backend.is_leader() && self.config.log_scalars {
            self.record_metrics(&graph, &output, ctx);
        }
        Ok(output)
    }

    fn compute_losses(&self, model: &Batch, expert: &Batch) -> Result<StepGraph> {
        let c = &self.config;
        let replicas = self.backend.world_size() as f64;
        let rssm = &self.world.rssm;

        // World model
        let embed = self.world.embed(&model.image, model.proprio.as_ref())?;
        let (post, prior) = rssm.observe(&embed, &model.action, None);
        let feat = rssm.get_feat(&post);
        let image_like = self
            .world
            .decoder
            .forward(&feat)
            .log_prob(&model.image)
            .mean(Kind::Float);
        let pcont_like = match &self.world.pcont {
            Some(head) => {
                let discount = model.discount.as_ref().ok_or_else(|| {
                    VmailError::Data("pcont is enabled but the batch has no discount".into())
                })?;
                let target = discount * c.discount;
                Some(head.forward(&feat).log_prob(&target).mean(Kind::Float) * c.pcont_scale)
            }
            None => None,
        };
        let div = clamped_divergence(
            &rssm.get_distribution(&post),
            &rssm.get_distribution(&prior),
            c.free_nats,
        )?;
        let likes = match &pcont_like {
            Some(pcont) => &image_like + pcont,
            None => image_like.shallow_clone(),
        };
        let model_loss = (&div * c.kl_scale - likes) / replicas;

        // Imagination from every posterior but the last
        let imag = imagine_ahead(rssm, &self.actor, &post, c.horizon);

        // Discriminator
        let expert_embed = self.world.embed(&expert.image, expert.proprio.as_ref())?;
        let (expert_post, _) = rssm.observe(&expert_embed, &expert.action, None);
        let expert_feat = rssm.get_feat(&expert_post);
        let steps = expert_feat.size()[1];
        let expert_pairs = Tensor::cat(
            &[
                expert_feat.narrow(1, 0, steps - 1),
                expert.action.narrow(1, 1, steps - 1),
            ],
            -1,
        );
        let policy_pairs = Tensor::cat(
            &[imag.features.narrow(0, 0, c.horizon), imag.actions.shallow_clone()],
            -1,
        );
        let disc = discriminator_losses(
            &self.discriminator,
            self.discriminator_opt.group(),
            &expert_pairs,
            &policy_pairs,
            c.alpha,
        )?;
        let discriminator_loss = &disc.loss / replicas;

        // Actor and value on imagined trajectories
        let reward = disc.policy.mean();
        let next_feat = imag.features.narrow(0, 1, c.horizon);
        let pcont = match &self.world.pcont {
            Some(head) => head.forward(&next_feat).mean(),
            None => reward.ones_like() * c.discount,
        };
        let value = self.value.forward(&next_feat).mode();
        let trim = |t: &Tensor| t.narrow(0, 0, c.horizon - 1);
        let returns = lambda_return(&trim(&reward), &trim(&value), &trim(&pcont), None, c.disclam);
        let discount = discount_weights(&pcont);
        let actor_loss = -(&discount * &returns).mean(Kind::Float) / replicas;

        let value_pred = self.value.forward(&trim(&next_feat));
        let value_loss =
            -(&discount * value_pred.log_prob(&returns.detach())).mean(Kind::Float) / replicas;

        Ok(StepGraph {
            model_loss,
            discriminator_loss,
            actor_loss,
            value_loss,
            post,
            prior,
            div,
            image_like,
            pcont_like,
            expert_d: disc.expert.mean(),
            policy_d: disc.policy.mean(),
            expert_term: disc.expert_term,
            policy_term: disc.policy_term,
            penalty: disc.penalty,
            reward,
        })
    }

    fn record_metrics(&self, g: &StepGraph, out: &TrainOutput, ctx: &mut TrainContext) {
        let rssm = &self.world.rssm;
        let scalar = |t: &Tensor| t.detach().mean(Kind::Float).double_value(&[]);
        let m = &mut ctx.metrics;

        m.update("model_grad_norm", out.model_norm);
        m.update("discriminator_norm", out.discriminator_norm);
        m.update("value_grad_norm", out.value_norm);
        m.update("actor_grad_norm", out.actor_norm);
        m.update("prior_ent", scalar(&rssm.get_distribution(&g.prior).entropy()));
        m.update("post_ent", scalar(&rssm.get_distribution(&g.post).entropy()));
        m.update("expert_d", scalar(&g.expert_d));
        m.update("policy_d", scalar(&g.policy_d));
        let max_policy_d = g
            .policy_d
            .detach()
            .mean_dim([1i64].as_slice(), false, Kind::Float)
            .max()
            .double_value(&[]);
        m.update("max_policy_d", max_policy_d);
        m.update("rewards", scalar(&g.reward));
        m.update("image_loss", -scalar(&g.image_like));
        if let Some(pcont) = &g.pcont_like {
            m.update("pcont_loss", -scalar(pcont));
        }
        m.update("div", scalar(&g.div));
        m.update("model_loss", out.model_loss);
        m.update("expert_loss", scalar(&g.expert_term));
        m.update("policy_loss", scalar(&g.policy_term));
        m.update("discriminator_loss", out.discriminator_loss);
        m.update("discriminator_penalty", scalar(&g.penalty));
        m.update("value_loss", out.value_loss);
        m.update("actor_loss", out.actor_loss);
        let action_ent = tch::no_grad(|| {
            let feat = rssm.get_feat(&g.post.detach());
            scalar(&self.actor.forward(&feat).entropy())
        });
        m.update("action_ent", action_ent);
    }

    /// Select an action from the current observation.
    ///
    /// `image: [B, H, W, C]` preprocessed, `proprio: [B, P]`. The carried
    /// state holds the previous posterior and action; `None` starts from
    /// the initial latent and a zero action.
    pub fn policy(
        &self,
        image: &Tensor,
        proprio: Option<&Tensor>,
        state: Option<(LatentState, Tensor)>,
        training: bool,
    ) -> Result<(Tensor, LatentState)> {
        let batch = image.size()[0];
        let device = self.device();
        tch::no_grad(|| {
            let (latent, action) = match state {
                Some(state) => state,
                None => (
                    self.world.rssm.initialize(batch, device),
                    Tensor::zeros([batch, self.action_dim], (Kind::Float, device)),
                ),
            };
            let embed = self.world.embed(image, proprio)?;
            let (latent, _) = self.world.rssm.obs_step(&latent, &action, &embed);
            let feat = self.world.rssm.get_feat(&latent);
            let dist: Distribution = self.actor.forward(&feat);
            let action = if training { dist.sample() } else { dist.mode() };
            Ok((action, latent))
        })
    }
}

/// Mean KL from prior to posterior, floored at `free_nats`.
fn clamped_divergence(
    post: &Distribution,
    prior: &Distribution,
    free_nats: f64,
) -> Result<Tensor> {
    let div = kl_divergence(post, prior)
        .ok_or_else(|| VmailError::Config("latent distributions must be Gaussian".into()))?
        .mean(Kind::Float);
    Ok(div.clamp_min(free_nats))
}

const GROUPS: [&str; 4] = ["model", "discriminator", "value", "actor"];

impl Checkpointable for Learner {
    fn named_tensors(&self) -> Vec<(String, Tensor)> {
        let mut tensors = Vec::new();
        for (group, opt) in GROUPS.iter().zip(self.optimizers()) {
            for (name, t) in opt.group().named() {
                tensors.push((format!("{}/params/{}", group, name), t.detach()));
            }
            for (key, t) in opt.state() {
                tensors.push((format!("{}/optimizer/{}", group, key), t));
            }
        }
        tensors
    }

    fn load_named_tensors(&mut self, tensors: &[(String, Tensor)]) -> Result<()> {
        for (group, opt) in GROUPS.iter().zip(self.optimizers_mut()) {
            let params_prefix = format!("{}/params/", group);
            let values = opt
                .group()
                .named()
                .map(|(name, _)| {
                    let key = format!("{}{}", params_prefix, name);
                    tensors
                        .iter()
                        .find(|(k, _)| *k == key)
                        .map(|(_, t)| t.shallow_clone())
                        .ok_or_else(|| VmailError::Checkpoint(format!("missing tensor {}", key)))
                })
                .collect::<Result<Vec<_>>>()?;
            opt.group().assign(&values)?;

            let opt_prefix = format!("{}/optimizer/", group);
            let state: Vec<(String, Tensor)> = tensors
                .iter()
                .filter_map(|(k, t)| {
                    k.strip_prefix(&opt_prefix)
                        .map(|key| (key.to_string(), t.shallow_clone()))
                })
                .collect();
            opt.load_state(&state)?;
        }
        Ok(())
    }
}
