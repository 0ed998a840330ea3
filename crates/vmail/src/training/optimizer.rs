//! Per-module optimizers: gradient computation, replica reduction,
//! global-norm clipping, decoupled weight decay and Adam.

use super::distributed::ReplicaBackend;
use crate::{Result, VmailError};
use regex::Regex;
use tch::{nn, Kind, Tensor};

/// Named parameters of one `VarStore`, sorted by name so every replica
/// sees them in the same order.
pub struct ParamGroup {
    name: String,
    params: Vec<(String, Tensor)>,
}

impl ParamGroup {
    pub fn new(name: &str, vs: &nn::VarStore) -> Self {
        let mut params: Vec<(String, Tensor)> = vs.variables().into_iter().collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.to_string(),
            params,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn tensors(&self) -> Vec<Tensor> {
        self.params.iter().map(|(_, t)| t.shallow_clone()).collect()
    }

    pub fn named(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.params.iter().map(|(n, t)| (n.as_str(), t))
    }

    /// Gradients of `loss` with respect to this group only. Parameters the
    /// loss does not reach get zero gradients.
    pub fn gradients(
        &self,
        loss: &Tensor,
        keep_graph: bool,
        create_graph: bool,
    ) -> Result<Vec<Tensor>> {
        let tensors = self.tensors();
        let grads = Tensor::f_run_backward(&[loss], &tensors, keep_graph, create_graph)?;
        Ok(grads
            .into_iter()
            .zip(tensors.iter())
            .map(|(g, p)| if g.defined() { g } else { p.zeros_like() })
            .collect())
    }

    /// Overwrite parameters with `values` (same order as `tensors()`).
    pub fn assign(&self, values: &[Tensor]) -> Result<()> {
        if values.len() != self.params.len() {
            return Err(VmailError::Checkpoint(format!(
                "group {} expects {} tensors, got {}",
                self.name,
                self.params.len(),
                values.len()
            )));
        }
        tch::no_grad(|| {
            for ((_, p), v) in self.params.iter().zip(values) {
                p.shallow_clone().f_copy_(v)?;
            }
            Ok(())
        })
    }
}

/// L2 norm over a list of tensors. Differentiable when the inputs carry a graph.
pub fn global_norm(tensors: &[Tensor]) -> Tensor {
    let squares: Vec<Tensor> = tensors.iter().map(|t| t.square().sum(Kind::Float)).collect();
    Tensor::stack(&squares, 0).sum(Kind::Float).sqrt()
}

/// Scale gradients so their global norm is at most `max_norm`.
pub fn clip_by_global_norm(grads: &[Tensor], max_norm: f64, norm: f64) -> Vec<Tensor> {
    let coef = max_norm / norm.max(max_norm);
    grads.iter().map(|g| g * coef).collect()
}

/// Update rule applied after gradients are reduced and clipped.
pub trait UpdateRule: Send {
    fn apply(&mut self, params: &[Tensor], grads: &[Tensor]) -> Result<()>;

    /// Tensors that must be checkpointed to resume the rule exactly.
    fn state(&self) -> Vec<(String, Tensor)>;

    fn load_state(&mut self, state: &[(String, Tensor)]) -> Result<()>;
}

/// Adam in the Keras formulation (`eps` added to `sqrt(v)`, bias folded
/// into the learning rate).
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    step: i64,
    m: Vec<Tensor>,
    v: Vec<Tensor>,
}

impl Adam {
    pub fn new(params: &[Tensor], lr: f64, eps: f64) -> Self {
        let zeros = || {
            params
                .iter()
                .map(|p| p.detach().zeros_like())
                .collect::<Vec<_>>()
        };
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps,
            step: 0,
            m: zeros(),
            v: zeros(),
        }
    }

    pub fn steps(&self) -> i64 {
        self.step
    }
}

impl UpdateRule for Adam {
    fn apply(&mut self, params: &[Tensor], grads: &[Tensor]) -> Result<()> {
        self.step += 1;
        let t = self.step as f64;
        let lr = self.lr * (1.0 - self.beta2.powf(t)).sqrt() / (1.0 - self.beta1.powf(t));
        let (b1, b2, eps) = (self.beta1, self.beta2, self.eps);
        tch::no_grad(|| {
            for (((p, g), m), v) in params
                .iter()
                .zip(grads)
                .zip(self.m.iter_mut())
                .zip(self.v.iter_mut())
            {
                *m = &*m * b1 + g * (1.0 - b1);
                *v = &*v * b2 + g.square() * (1.0 - b2);
                let update = &*m / (v.sqrt() + eps) * lr;
                p.shallow_clone().f_sub_(&update)?;
            }
            Ok(())
        })
    }

    fn state(&self) -> Vec<(String, Tensor)> {
        let mut state = vec![("step".to_string(), Tensor::from(self.step))];
        for (i, (m, v)) in self.m.iter().zip(&self.v).enumerate() {
            state.push((format!("m.{}", i), m.shallow_clone()));
            state.push((format!("v.{}", i), v.shallow_clone()));
        }
        state
    }

    fn load_state(&mut self, state: &[(String, Tensor)]) -> Result<()> {
        let find = |key: &str| {
            state
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, t)| t.shallow_clone())
                .ok_or_else(|| VmailError::Checkpoint(format!("missing optimizer entry {}", key)))
        };
        self.step = find("step")?.int64_value(&[]);
        for i in 0..self.m.len() {
            let device = self.m[i].device();
            self.m[i] = find(&format!("m.{}", i))?.to_device(device);
            self.v[i] = find(&format!("v.{}", i))?.to_device(device);
        }
        Ok(())
    }
}

/// Dynamic loss scaling for half precision training.
pub struct GradScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    growth_tracker: usize,
}

impl GradScaler {
    pub fn new(initial_scale: f64) -> Self {
        Self {
            scale: initial_scale,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
        }
    }

    pub fn scale(&self, loss: &Tensor) -> Tensor {
        loss * self.scale
    }

    pub fn unscale(&self, grads: &[Tensor]) -> Vec<Tensor> {
        let inv = 1.0 / self.scale;
        grads.iter().map(|g| g * inv).collect()
    }

    /// Adjust the scale after a step. Returns whether the step should apply.
    pub fn update(&mut self, finite: bool) -> bool {
        if !finite {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
            return false;
        }
        self.growth_tracker += 1;
        if self.growth_tracker >= self.growth_interval {
            self.scale *= self.growth_factor;
            self.growth_tracker = 0;
        }
        true
    }

    pub fn current_scale(&self) -> f64 {
        self.scale
    }
}

/// Settings shared by the four module optimizers.
#[derive(Clone, Debug)]
pub struct OptimizerSettings {
    pub grad_clip: f64,
    pub weight_decay: f64,
    pub weight_decay_pattern: String,
    pub eps: f64,
    pub loss_scaling: bool,
}

/// Optimizer owning one named parameter group.
pub struct ModuleOptimizer {
    group: ParamGroup,
    rule: Box<dyn UpdateRule>,
    grad_clip: f64,
    weight_decay: f64,
    decay_mask: Vec<bool>,
    scaler: Option<GradScaler>,
}

impl ModuleOptimizer {
    pub fn new(
        name: &str,
        vs: &nn::VarStore,
        lr: f64,
        settings: &OptimizerSettings,
    ) -> Result<Self> {
        let group = ParamGroup::new(name, vs);
        let pattern = Regex::new(&settings.weight_decay_pattern)
            .map_err(|e| VmailError::Config(format!("invalid weight_decay_pattern: {}", e)))?;
        let decay_mask = group
            .named()
            .map(|(param, _)| pattern.is_match(&format!("{}/{}", name, param)))
            .collect();
        let rule = Box::new(Adam::new(&group.tensors(), lr, settings.eps));
        Ok(Self {
            group,
            rule,
            grad_clip: settings.grad_clip,
            weight_decay: settings.weight_decay,
            decay_mask,
            scaler: settings.loss_scaling.then(|| GradScaler::new(65536.0)),
        })
    }

    pub fn name(&self) -> &str {
        self.group.name()
    }

    pub fn group(&self) -> &ParamGroup {
        &self.group
    }

    /// Gradients of `loss` for this group. The loss is multiplied by the
    /// current loss scale when half precision is enabled.
    pub fn compute_gradients(&self, loss: &Tensor, keep_graph: bool) -> Result<Vec<Tensor>> {
        match &self.scaler {
            Some(scaler) => self.group.gradients(&scaler.scale(loss), keep_graph, false),
            None => self.group.gradients(loss, keep_graph, false),
        }
    }

    /// Reduce gradients across replicas, clip, decay and update.
    /// Returns the global gradient norm before clipping.
    pub fn apply(&mut self, grads: Vec<Tensor>, backend: &dyn ReplicaBackend) -> Result<f64> {
        let mut grads = grads;
        backend.all_reduce_sum(&mut grads)?;
        if let Some(scaler) = &self.scaler {
            grads = scaler.unscale(&grads);
        }
        let norm = global_norm(&grads).double_value(&[]);

        if let Some(scaler) = self.scaler.as_mut() {
            if !scaler.update(norm.is_finite()) {
                tracing::warn!(
                    group = self.group.name(),
                    scale = scaler.current_scale(),
                    "non-finite gradients, skipping update"
                );
                return Ok(norm);
            }
        }

        let grads = clip_by_global_norm(&grads, self.grad_clip, norm);
        if self.weight_decay > 0.0 {
            self.apply_weight_decay()?;
        }
        self.rule.apply(&self.group.tensors(), &grads)?;
        Ok(norm)
    }

    fn apply_weight_decay(&self) -> Result<()> {
        let factor = 1.0 - self.weight_decay;
        tch::no_grad(|| {
            for ((_, p), decay) in self.group.named().zip(&self.decay_mask) {
                if *decay {
                    p.shallow_clone().f_mul_scalar_(factor)?;
                }
            }
            Ok(())
        })
    }

    pub fn state(&self) -> Vec<(String, Tensor)> {
        self.rule.state()
    }

    pub fn load_state(&mut self, state: &[(String, Tensor)]) -> Result<()> {
        self.rule.load_state(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::LocalBackend;
    use tch::Device;

    fn settings() -> OptimizerSettings {
        OptimizerSettings {
            grad_clip: 100.0,
            weight_decay: 0.0,
            weight_decay_pattern: ".*".to_string(),
            eps: 1e-7,
            loss_scaling: false,
        }
    }

    fn linear_store() -> (nn::VarStore, nn::Linear) {
        let vs = nn::VarStore::new(Device::Cpu);
        let lin = nn::linear(vs.root() / "lin", 3, 1, Default::default());
        (vs, lin)
    }

    #[test]
    fn test_param_group_is_sorted() {
        let (vs, _) = linear_store();
        let group = ParamGroup::new("model", &vs);
        let names: Vec<&str> = group.named().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["lin.bias", "lin.weight"]);
    }

    #[test]
    fn test_clip_by_global_norm() {
        let grads = vec![Tensor::from_slice(&[3.0f32, 4.0])];
        let norm = global_norm(&grads).double_value(&[]);
        assert!((norm - 5.0).abs() < 1e-6);
        let clipped = clip_by_global_norm(&grads, 1.0, norm);
        assert!((global_norm(&clipped).double_value(&[]) - 1.0).abs() < 1e-6);
        let untouched = clip_by_global_norm(&grads, 10.0, norm);
        assert!(untouched[0].equal(&grads[0]));
    }

    #[test]
    fn test_apply_reduces_loss_and_returns_norm() {
        let (vs, lin) = linear_store();
        let mut opt = ModuleOptimizer::new("model", &vs, 1e-2, &settings()).unwrap();
        let xs = Tensor::ones([4, 3], (Kind::Float, Device::Cpu));
        let loss_of = || xs.apply(&lin).square().mean(Kind::Float);

        let before = loss_of().double_value(&[]);
        for _ in 0..20 {
            let grads = opt.compute_gradients(&loss_of(), false).unwrap();
            let norm = opt.apply(grads, &LocalBackend).unwrap();
            assert!(norm.is_finite());
        }
        assert!(loss_of().double_value(&[]) < before);
        assert_eq!(opt.state()[0].1.int64_value(&[]), 20);
    }

    #[test]
    fn test_weight_decay_respects_pattern() {
        let (vs, lin) = linear_store();
        let mut s = settings();
        s.weight_decay = 0.5;
        s.weight_decay_pattern = r"weight$".to_string();
        let mut opt = ModuleOptimizer::new("model", &vs, 0.0, &s).unwrap();
        let bias_before = lin.bs.as_ref().unwrap().copy();
        let weight_before = lin.ws.copy();

        let xs = Tensor::ones([1, 3], (Kind::Float, Device::Cpu));
        let grads = opt
            .compute_gradients(&xs.apply(&lin).sum(Kind::Float), false)
            .unwrap();
        opt.apply(grads, &LocalBackend).unwrap();

        assert!(lin.bs.as_ref().unwrap().equal(&bias_before));
        assert!(lin.ws.allclose(&(weight_before * 0.5), 1e-6, 1e-6, false));
    }

    #[test]
    fn test_adam_state_roundtrip() {
        let (vs, _) = linear_store();
        let group = ParamGroup::new("model", &vs);
        let mut adam = Adam::new(&group.tensors(), 1e-3, 1e-7);
        let grads: Vec<Tensor> = group.tensors().iter().map(|p| p.ones_like()).collect();
        adam.apply(&group.tensors(), &grads).unwrap();

        let mut restored = Adam::new(&group.tensors(), 1e-3, 1e-7);
        restored.load_state(&adam.state()).unwrap();
        assert_eq!(restored.steps(), 1);
        assert!(restored.m[0].equal(&adam.m[0]));
    }

    #[test]
    fn test_grad_scaler_backs_off_on_overflow() {
        let mut scaler = GradScaler::new(1024.0);
        assert!(!scaler.update(false));
        assert_eq!(scaler.current_scale(), 512.0);
        assert!(scaler.update(true));
    }
}
