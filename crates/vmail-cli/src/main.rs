//! vmail CLI
//!
//! Train imitation agents, record expert demonstrations and inspect
//! episode directories.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use vmail::data::{count_episodes, count_steps};
use vmail::env::Environment;
use vmail::log::{CompositeLogger, ConsoleLogger, JsonlLogger, MetricLogger};
use vmail::prelude::VmailConfig;
use vmail::utils::{abbreviate, format_duration};
use vmail_envs::{record_demonstrations, EnvKind, PointReach, ScriptedExpert};

#[derive(Parser)]
#[command(name = "vmail")]
#[command(
    version,
    about = "vmail - visual model-based adversarial imitation learning",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train an agent from expert demonstrations
    Train {
        /// JSON config file; missing keys use defaults
        #[arg(long)]
        config: Option<PathBuf>,

        /// Start from the compact CPU-sized network preset
        #[arg(long)]
        small: bool,

        /// Root for logdir, model_data and policy_data
        #[arg(long, default_value = "logs")]
        basedir: PathBuf,

        /// Directory holding the expert episodes
        #[arg(long)]
        expert_dir: Option<PathBuf>,

        /// Environment name
        #[arg(long)]
        env: Option<String>,

        /// Total environment steps
        #[arg(long)]
        steps: Option<u64>,

        /// Number of synchronous training replicas
        #[arg(long)]
        replicas: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,

        /// Train on CUDA when available
        #[arg(long)]
        cuda: bool,

        /// Override any config key, e.g. `--set batch_size=16`
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
    },

    /// Record scripted expert demonstrations
    CollectExpert {
        #[arg(long, default_value = "point_reach")]
        env: String,

        /// Number of episodes to record
        #[arg(long, default_value = "10")]
        episodes: usize,

        /// Output directory
        #[arg(long, default_value = ".expert")]
        out: PathBuf,

        /// Maximum episode length in environment steps
        #[arg(long, default_value = "1000")]
        time_limit: u64,

        /// Standard deviation of the Gaussian noise added to expert actions
        #[arg(long, default_value = "0.0")]
        noise: f32,

        #[arg(long, default_value = "0")]
        seed: u64,
    },

    /// List environments and summarize episode directories
    List {
        /// Episode directories to summarize
        dirs: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            config,
            small,
            basedir,
            expert_dir,
            env,
            steps,
            replicas,
            seed,
            cuda,
            overrides,
        } => {
            let mut config = match config {
                Some(path) => VmailConfig::from_json_file(&path)
                    .with_context(|| format!("reading config {}", path.display()))?,
                None if small => VmailConfig::small(),
                None => VmailConfig::default(),
            };
            config = config.with_basedir(basedir);
            if let Some(dir) = expert_dir {
                config.expert_datadir = dir;
            }
            if let Some(env) = env {
                config.env = env;
            }
            if let Some(steps) = steps {
                config.steps = steps;
            }
            if let Some(replicas) = replicas {
                config = config.with_replicas(replicas);
            }
            if let Some(seed) = seed {
                config = config.with_seed(seed);
            }
            // Overrides round-trip through JSON, which does not carry the device.
            config = apply_overrides(config, &overrides)?;
            if cuda {
                if tch::Cuda::is_available() {
                    tracing::info!("Using CUDA");
                    config = config.cuda();
                } else {
                    tracing::warn!("CUDA requested but not available, using CPU");
                }
            }
            train(&config)?;
        }
        Commands::CollectExpert {
            env,
            episodes,
            out,
            time_limit,
            noise,
            seed,
        } => {
            collect_expert(&env, episodes, &out, time_limit, noise, seed)?;
        }
        Commands::List { dirs } => {
            list(&dirs)?;
        }
    }

    Ok(())
}

/// Apply `key=value` overrides through the config's JSON form. Values that
/// do not parse as JSON are taken as strings.
fn apply_overrides(config: VmailConfig, overrides: &[String]) -> Result<VmailConfig> {
    if overrides.is_empty() {
        return Ok(config);
    }
    let mut value = serde_json::to_value(&config)?;
    let object = value
        .as_object_mut()
        .context("config does not serialize to an object")?;
    for item in overrides {
        let (key, raw) = item
            .split_once('=')
            .with_context(|| format!("override '{}' is not KEY=VALUE", item))?;
        if !object.contains_key(key) {
            bail!("unknown config key '{}'", key);
        }
        let parsed = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        object.insert(key.to_string(), parsed);
    }
    serde_json::from_value(value).context("invalid config override")
}

fn make_logger(config: &VmailConfig) -> Result<Arc<dyn MetricLogger>> {
    let mut logger = CompositeLogger::default();
    logger.add(Box::new(ConsoleLogger::new()));
    logger.add(Box::new(JsonlLogger::new(&config.logdir)?));
    #[cfg(feature = "tensorboard")]
    logger.add(Box::new(vmail::log::TensorBoardLogger::new(&config.logdir)));
    Ok(Arc::new(logger))
}

fn train(config: &VmailConfig) -> Result<()> {
    let kind: EnvKind = config.env.parse()?;
    let (expert_episodes, _) = count_episodes(&config.expert_datadir).unwrap_or((0, 0));
    if expert_episodes == 0 {
        bail!(
            "no expert episodes in {}; record some with `vmail collect-expert --out {}`",
            config.expert_datadir.display(),
            config.expert_datadir.display()
        );
    }

    tracing::info!(
        env = %kind,
        steps = config.steps,
        replicas = config.replicas,
        expert_episodes,
        logdir = %config.logdir.display(),
        "Starting training"
    );

    let logger = make_logger(config)?;
    let seed = config.seed;
    let factory = move |index: usize| -> vmail::Result<Box<dyn Environment>> {
        Ok(kind.make(seed.wrapping_add(index as u64)))
    };

    let pb = ProgressBar::new(config.steps);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(concat!(
                "{spinner:.green} [{elapsed_precise}] ",
                "[{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            ))?
            .progress_chars("#>-"),
    );

    let start = Instant::now();
    let step = vmail::runner::run(config, &factory, logger, |step| pb.set_position(step))?;
    pb.finish_and_clear();

    tracing::info!(
        step,
        elapsed = %format_duration(start.elapsed().as_secs_f64()),
        "Training complete"
    );
    Ok(())
}

fn collect_expert(
    env: &str,
    episodes: usize,
    out: &Path,
    time_limit: u64,
    noise: f32,
    seed: u64,
) -> Result<()> {
    let kind: EnvKind = env.parse()?;
    tracing::info!(env = %kind, episodes, out = %out.display(), "Recording demonstrations");

    let files = match kind {
        EnvKind::PointReach => {
            let mut expert = ScriptedExpert::new(seed);
            if noise > 0.0 {
                expert = expert.with_noise(noise)?;
            }
            record_demonstrations(PointReach::new(seed), &mut expert, episodes, time_limit, out)?
        }
    };

    let (count, steps) = count_episodes(out)?;
    println!(
        "Recorded {} episodes into {} ({} episodes, {} steps total)",
        files.len(),
        out.display(),
        count,
        abbreviate(steps)
    );
    Ok(())
}

fn list(dirs: &[PathBuf]) -> Result<()> {
    println!("Available environments:");
    for kind in EnvKind::ALL {
        println!("  {:<12} - {}", kind.name(), kind.description());
    }

    if !dirs.is_empty() {
        println!();
        println!("Episode directories:");
    }
    for dir in dirs {
        if !dir.is_dir() {
            println!("  {} (missing)", dir.display());
            continue;
        }
        let (episodes, _) = count_episodes(dir)?;
        let steps = count_steps(dir, 1)?;
        println!(
            "  {} - {} episodes, {} steps",
            dir.display(),
            abbreviate(episodes as u64),
            abbreviate(steps)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_update_config() {
        let config = apply_overrides(
            VmailConfig::default(),
            &["batch_size=16".to_string(), "env=point_reach".to_string()],
        )
        .unwrap();
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.env, "point_reach");
    }

    #[test]
    fn test_overrides_reject_unknown_keys() {
        assert!(apply_overrides(VmailConfig::default(), &["nope=1".to_string()]).is_err());
        assert!(apply_overrides(VmailConfig::default(), &["batch_size".to_string()]).is_err());
    }
}
