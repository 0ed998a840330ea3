//! Agent and training configuration.

use crate::{Result, VmailError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tch::{Device, Tensor};

/// Exploration noise applied to actions sent to a real environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exploration {
    /// Add Gaussian noise, then clip to `[-1, 1]`
    AdditiveGaussian,
    /// Ignore the policy and act uniformly at random
    CompletelyRandom,
    /// Replace the action with a random one-hot choice with some probability
    EpsilonGreedy,
}

/// Output distribution of the actor network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionDist {
    TanhNormal,
    Onehot,
}

/// Nonlinearity used inside dense and convolutional stacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Elu,
    Relu,
    Swish,
    LeakyRelu,
}

/// Reward transform applied when batches are loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipRewards {
    None,
    Tanh,
}

/// Floating point precision of the training computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precision {
    Half,
    Full,
}

impl Activation {
    pub fn apply(&self, xs: &Tensor) -> Tensor {
        match self {
            Activation::Elu => xs.elu(),
            Activation::Relu => xs.relu(),
            Activation::Swish => xs * xs.sigmoid(),
            Activation::LeakyRelu => xs.leaky_relu(),
        }
    }
}

impl ClipRewards {
    pub fn apply(&self, rewards: &Tensor) -> Tensor {
        match self {
            ClipRewards::None => rewards.shallow_clone(),
            ClipRewards::Tanh => rewards.tanh(),
        }
    }
}

impl TryFrom<u32> for Precision {
    type Error = VmailError;

    fn try_from(bits: u32) -> Result<Self> {
        match bits {
            16 => Ok(Precision::Half),
            32 => Ok(Precision::Full),
            other => Err(VmailError::Config(format!(
                "precision must be 16 or 32, got {}",
                other
            ))),
        }
    }
}

macro_rules! config_enum_str {
    ($ty:ty, $($variant:path => $name:literal),+ $(,)?) => {
        impl FromStr for $ty {
            type Err = VmailError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($name => Ok($variant),)+
                    other => Err(VmailError::Config(format!(
                        "unknown {} '{}'",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let name = match self {
                    $($variant => $name,)+
                };
                f.write_str(name)
            }
        }
    };
}

config_enum_str!(Exploration,
    Exploration::AdditiveGaussian => "additive_gaussian",
    Exploration::CompletelyRandom => "completely_random",
    Exploration::EpsilonGreedy => "epsilon_greedy",
);
config_enum_str!(ActionDist,
    ActionDist::TanhNormal => "tanh_normal",
    ActionDist::Onehot => "onehot",
);
config_enum_str!(Activation,
    Activation::Elu => "elu",
    Activation::Relu => "relu",
    Activation::Swish => "swish",
    Activation::LeakyRelu => "leaky_relu",
);
config_enum_str!(ClipRewards,
    ClipRewards::None => "none",
    ClipRewards::Tanh => "tanh",
);

/// Configuration for the imitation agent
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VmailConfig {
    // General
    /// Directory for metrics, config dump and checkpoint
    pub logdir: PathBuf,
    /// Episodes used to fit the world model (expert copies + collected)
    pub model_datadir: PathBuf,
    /// Episodes collected by the policy only; source of the step counter
    pub policy_datadir: PathBuf,
    /// Expert demonstrations
    pub expert_datadir: PathBuf,
    pub seed: u64,
    /// Total environment steps to run
    pub steps: u64,
    pub eval_every: u64,
    pub log_every: u64,
    pub log_scalars: bool,
    /// 16 or 32
    pub precision: u32,
    #[serde(skip, default = "default_device")]
    pub device: Device,

    // Environment
    pub env: String,
    pub use_depth_obs: bool,
    pub use_proprio_obs: bool,
    pub num_envs: usize,
    pub action_repeat: u64,
    pub time_limit: u64,
    /// Random-policy steps collected before training starts
    pub prefill: u64,
    pub eval_noise: f64,
    pub clip_rewards: ClipRewards,

    // Model
    pub deter_size: i64,
    pub stoch_size: i64,
    pub num_units: i64,
    pub dense_act: Activation,
    pub cnn_act: Activation,
    pub cnn_depth: i64,
    /// Height and width of image observations
    pub image_size: [i64; 2],
    /// Learn a continuation predictor instead of a fixed discount
    pub pcont: bool,
    pub free_nats: f64,
    /// Gradient penalty weight of the discriminator
    pub alpha: f64,
    pub kl_scale: f64,
    pub pcont_scale: f64,
    pub weight_decay: f64,
    pub weight_decay_pattern: String,
    pub discriminator_layers: i64,
    pub value_layers: i64,
    pub actor_layers: i64,

    // Proprioceptive encoder
    pub proprio_layers: i64,
    pub hidden_units: i64,
    pub out_units: i64,

    // Training
    pub batch_size: i64,
    pub batch_length: i64,
    pub train_every: u64,
    pub train_steps: u64,
    /// Number of train steps on the first training call
    pub pretrain: u64,
    pub model_lr: f64,
    pub discriminator_lr: f64,
    pub value_lr: f64,
    pub actor_lr: f64,
    pub grad_clip: f64,
    pub adam_eps: f64,
    pub dataset_balance: bool,
    /// Store collected episodes on disk
    pub store: bool,
    /// Number of synchronous data-parallel replicas
    pub replicas: usize,

    // Behavior
    pub discount: f64,
    /// Lambda of the imagined return estimate
    pub disclam: f64,
    pub horizon: i64,
    pub action_dist: ActionDist,
    pub action_init_std: f64,

    // Exploration
    pub expl: Exploration,
    pub expl_amount: f64,
    pub expl_decay: f64,
    pub expl_min: f64,
}

fn default_device() -> Device {
    Device::Cpu
}

impl Default for VmailConfig {
    fn default() -> Self {
        Self {
            logdir: PathBuf::from("logs/logdir"),
            model_datadir: PathBuf::from("logs/model_data"),
            policy_datadir: PathBuf::from("logs/policy_data"),
            expert_datadir: PathBuf::from(".expert"),
            seed: 1,
            steps: 1_000_000,
            eval_every: 1000,
            log_every: 100,
            log_scalars: true,
            precision: 32,
            device: Device::Cpu,

            env: "point_reach".to_string(),
            use_depth_obs: false,
            use_proprio_obs: true,
            num_envs: 1,
            action_repeat: 1,
            time_limit: 1000,
            prefill: 1000,
            eval_noise: 0.0,
            clip_rewards: ClipRewards::None,

            deter_size: 200,
            stoch_size: 30,
            num_units: 400,
            dense_act: Activation::Elu,
            cnn_act: Activation::Relu,
            cnn_depth: 32,
            image_size: [64, 64],
            pcont: false,
            free_nats: 3.0,
            alpha: 1.0,
            kl_scale: 1.0,
            pcont_scale: 10.0,
            weight_decay: 0.0,
            weight_decay_pattern: r".*".to_string(),
            discriminator_layers: 2,
            value_layers: 3,
            actor_layers: 4,

            proprio_layers: 0,
            hidden_units: 32,
            out_units: 32,

            batch_size: 128,
            batch_length: 50,
            train_every: 1000,
            train_steps: 200,
            pretrain: 100,
            model_lr: 6e-4,
            discriminator_lr: 8e-5,
            value_lr: 8e-5,
            actor_lr: 8e-5,
            grad_clip: 100.0,
            adam_eps: 1e-7,
            dataset_balance: false,
            store: true,
            replicas: 1,

            discount: 0.99,
            disclam: 1.0,
            horizon: 15,
            action_dist: ActionDist::TanhNormal,
            action_init_std: 5.0,

            expl: Exploration::AdditiveGaussian,
            expl_amount: 0.3,
            expl_decay: 0.0,
            expl_min: 0.0,
        }
    }
}

impl VmailConfig {
    /// Compact network sizes that train quickly on a CPU.
    pub fn small() -> Self {
        Self {
            deter_size: 32,
            stoch_size: 8,
            num_units: 32,
            cnn_depth: 4,
            hidden_units: 16,
            out_units: 16,
            batch_size: 8,
            batch_length: 10,
            horizon: 5,
            ..Default::default()
        }
    }

    /// Create config for CUDA device
    pub fn cuda(mut self) -> Self {
        self.device = Device::Cuda(0);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_batch(mut self, batch_size: i64, batch_length: i64) -> Self {
        self.batch_size = batch_size;
        self.batch_length = batch_length;
        self
    }

    pub fn with_latent(mut self, stoch_size: i64, deter_size: i64) -> Self {
        self.stoch_size = stoch_size;
        self.deter_size = deter_size;
        self
    }

    pub fn with_horizon(mut self, horizon: i64) -> Self {
        self.horizon = horizon;
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    /// Root all data and log directories under `basedir`.
    pub fn with_basedir(mut self, basedir: impl Into<PathBuf>) -> Self {
        let basedir = basedir.into();
        self.logdir = basedir.join("logdir");
        self.model_datadir = basedir.join("model_data");
        self.policy_datadir = basedir.join("policy_data");
        self
    }

    /// Size of the latent feature vector `concat(stoch, deter)`.
    pub fn feature_size(&self) -> i64 {
        self.stoch_size + self.deter_size
    }

    /// Number of image channels fed to the encoder and produced by the decoder.
    pub fn image_channels(&self) -> i64 {
        if self.use_depth_obs {
            4
        } else {
            3
        }
    }

    pub fn precision(&self) -> Result<Precision> {
        Precision::try_from(self.precision)
    }

    /// Load a JSON config file; missing keys fall back to defaults.
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let config: Self = serde_json::from_reader(file)?;
        Ok(config)
    }

    /// Check the settings the training core relies on.
    pub fn validate(&self) -> Result<()> {
        let precision = self.precision()?;
        if precision == Precision::Half && !self.device.is_cuda() {
            return Err(VmailError::Config(
                "precision 16 requires a CUDA device".to_string(),
            ));
        }
        if self.image_size != [64, 64] {
            return Err(VmailError::Config(format!(
                "image decoder produces 64x64 frames, got {:?}",
                self.image_size
            )));
        }
        if self.batch_length < 2 {
            return Err(VmailError::Config(
                "batch_length must be at least 2".to_string(),
            ));
        }
        if self.horizon < 2 {
            return Err(VmailError::Config("horizon must be at least 2".to_string()));
        }
        if self.replicas == 0 || self.num_envs == 0 || self.action_repeat == 0 {
            return Err(VmailError::Config(
                "replicas, num_envs and action_repeat must be positive".to_string(),
            ));
        }
        regex::Regex::new(&self.weight_decay_pattern).map_err(|e| {
            VmailError::Config(format!("invalid weight_decay_pattern: {}", e))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = VmailConfig::default();
        config.validate().unwrap();
        assert_eq!(config.feature_size(), 230);
        assert_eq!(config.expl, Exploration::AdditiveGaussian);
    }

    #[test]
    fn test_precision_is_checked() {
        let mut config = VmailConfig::default();
        config.precision = 8;
        assert!(matches!(config.validate(), Err(VmailError::Config(_))));

        config.precision = 16;
        assert!(config.validate().is_err(), "half precision needs CUDA");
    }

    #[test]
    fn test_unknown_exploration_is_fatal() {
        assert_eq!(
            "epsilon_greedy".parse::<Exploration>().unwrap(),
            Exploration::EpsilonGreedy
        );
        assert!("boltzmann".parse::<Exploration>().is_err());
        assert_eq!(Exploration::CompletelyRandom.to_string(), "completely_random");
    }

    #[test]
    fn test_json_roundtrip_keeps_enums() {
        let config = VmailConfig::small().with_horizon(7);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"tanh_normal\""));
        let restored: VmailConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.horizon, 7);
        assert_eq!(restored.action_dist, ActionDist::TanhNormal);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let restored: VmailConfig = serde_json::from_str(r#"{"horizon": 4}"#).unwrap();
        assert_eq!(restored.horizon, 4);
        assert_eq!(restored.batch_length, 50);
    }

    #[test]
    fn test_depth_adds_a_channel() {
        let mut config = VmailConfig::default();
        assert_eq!(config.image_channels(), 3);
        config.use_depth_obs = true;
        assert_eq!(config.image_channels(), 4);
    }
}
