//! Checkpoint Tool
//!
//! Offline helper for experiment directories:
//! - `config`: write a validated starting configuration
//! - `inspect`: summarise a `{branch}.json` checkpoint
//! - `buffer`: summarise a replay buffer snapshot
//!
//! Usage:
//!   cargo run --release --bin checkpoint_tool -- config --id iqn_run --iqn -o config.json
//!   cargo run --release --bin checkpoint_tool -- inspect /farm/iqn_run/models/main.json
//!   cargo run --release --bin checkpoint_tool -- buffer /farm/iqn_run/replay.json

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use dqn_trader::config::{AgentVariant, ExperimentConfig, QuantileConfig};
use dqn_trader::rl::{Checkpoint, ReplayBuffer};

/// Inspect and bootstrap off-policy training experiments
#[derive(Parser, Debug)]
#[command(name = "checkpoint_tool")]
#[command(about = "Inspect checkpoints and replay snapshots, or write a starting config")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default experiment configuration
    Config {
        /// Experiment identifier
        #[arg(long, default_value = "experiment")]
        id: String,

        /// Directory holding experiment folders
        #[arg(long, default_value = "farm")]
        basepath: PathBuf,

        /// Number of traded assets
        #[arg(long, default_value = "1")]
        assets: usize,

        /// Use the quantile (IQN) agent instead of DQN
        #[arg(long)]
        iqn: bool,

        /// Output file
        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,
    },

    /// Summarise a checkpoint file
    Inspect {
        path: PathBuf,

        /// Also list every parameter tensor
        #[arg(short, long)]
        verbose: bool,
    },

    /// Summarise a replay buffer snapshot
    Buffer { path: PathBuf },
}

fn write_config(
    id: String,
    basepath: PathBuf,
    assets: usize,
    iqn: bool,
    output: PathBuf,
) -> Result<()> {
    let mut config = ExperimentConfig::new(id, basepath);
    config.n_assets = assets;
    if iqn {
        config.agent = AgentVariant::Iqn(QuantileConfig::default());
    }
    config.validate().context("default configuration failed validation")?;
    config
        .save_json(&output)
        .with_context(|| format!("Failed to write config to {}", output.display()))?;
    info!(
        path = %output.display(),
        agent = config.agent.name(),
        savepath = %config.savepath().display(),
        "[TOOL] Wrote configuration"
    );
    Ok(())
}

fn inspect(path: PathBuf, verbose: bool) -> Result<()> {
    let checkpoint = Checkpoint::load(&path)
        .with_context(|| format!("Failed to load checkpoint {}", path.display()))?;

    info!("════════════════════════════════════════════════════════════");
    info!("[TOOL] Checkpoint {}", path.display());
    info!("   agent:          {}", checkpoint.agent);
    info!("   saved at:       {}", checkpoint.saved_at);
    info!("   training steps: {}", checkpoint.state.training_steps);
    info!("   env steps:      {}", checkpoint.state.env_steps);
    info!("   eps:            {:.6}", checkpoint.state.eps);
    info!("   optimizer step: {}", checkpoint.optimizer.timestep());
    info!(
        "   parameters:     {} tensors / {} values",
        checkpoint.behaviour.len(),
        checkpoint.behaviour.numel()
    );
    info!(
        "   behaviour norm: {:.4} | target norm: {:.4}",
        checkpoint.behaviour.global_norm(),
        checkpoint.target.global_norm()
    );
    if verbose {
        for (name, shape) in checkpoint.behaviour.shapes() {
            info!("   {:<24} {:?}", name, shape);
        }
    }
    info!("════════════════════════════════════════════════════════════");
    Ok(())
}

fn buffer(path: PathBuf) -> Result<()> {
    let buffer = ReplayBuffer::load(&path)
        .with_context(|| format!("Failed to load replay snapshot {}", path.display()))?;
    let dones = buffer.iter().filter(|t| t.done).count();

    info!("════════════════════════════════════════════════════════════");
    info!("[TOOL] Replay buffer {}", path.display());
    info!("   records:        {} / {}", buffer.len(), buffer.capacity());
    info!("   n-step:         {}", buffer.config().nstep);
    info!("   prioritized:    {}", buffer.is_prioritized());
    if buffer.is_prioritized() {
        info!("   beta:           {:.4}", buffer.beta());
    }
    info!("   avg reward:     {:.6}", buffer.average_reward());
    info!("   terminal:       {}", dones);
    info!("════════════════════════════════════════════════════════════");
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Command::Config {
            id,
            basepath,
            assets,
            iqn,
            output,
        } => write_config(id, basepath, assets, iqn, output),
        Command::Inspect { path, verbose } => inspect(path, verbose),
        Command::Buffer { path } => buffer(path),
    }
}
