//! Train the speaker-conditioned Tacotron synthesizer.
//!
//! Reads a preprocessed corpus (`train.txt`, `mels/`, `embeds/`) and writes
//! checkpoints plus evaluation exports under `<models-dir>/<run_id>/`.
//! Resumes from `<run_id>.safetensors` unless `--force-restart` is given.
//!
//! Exit code 0 when the schedule (or `--train-steps`) is reached.

use std::path::PathBuf;

use clap::Parser;
use tacotron_rs::config::HParams;
use tacotron_rs::train::{TrainOutcome, Trainer, TrainerOptions};

#[derive(Parser, Debug)]
#[command(
    name = "synthesizer-train",
    about = "Train the Tacotron synthesizer on a preprocessed corpus"
)]
struct Args {
    /// Name of this run. Checkpoints and exports go to <models-dir>/<run_id>/.
    run_id: String,

    /// Directory containing train.txt, mels/ and embeds/.
    syn_dir: PathBuf,

    #[arg(long, short = 'm', default_value = "synthesizer/saved_models")]
    models_dir: PathBuf,

    /// Write the latest checkpoint every N steps (0 disables).
    #[arg(long, short = 's', default_value_t = 1000)]
    save_every: u64,

    /// Write a separate backup checkpoint every N steps (0 disables).
    #[arg(long, short = 'b', default_value_t = 25_000)]
    backup_every: u64,

    /// Ignore any existing checkpoint and train from scratch.
    #[arg(long, short = 'f')]
    force_restart: bool,

    /// Stop once the global step reaches this value.
    #[arg(long)]
    train_steps: Option<u64>,

    /// JSON file overriding the default hyper-parameters.
    #[arg(long)]
    hparams: Option<PathBuf>,

    /// Train on the CPU even if a GPU is available.
    #[arg(long)]
    cpu: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if !args.syn_dir.join("train.txt").is_file() {
        anyhow::bail!("{} has no train.txt", args.syn_dir.display());
    }

    let hparams = match &args.hparams {
        Some(path) => HParams::from_json_file(path)
            .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", path.display()))?,
        None => HParams::default(),
    };

    let device = if args.cpu {
        candle_core::Device::Cpu
    } else {
        candle_core::Device::cuda_if_available(0)?
    };

    let options = TrainerOptions {
        run_id: args.run_id,
        syn_dir: args.syn_dir,
        models_dir: args.models_dir,
        save_every: args.save_every,
        backup_every: args.backup_every,
        force_restart: args.force_restart,
        train_steps: args.train_steps,
    };

    let mut trainer = Trainer::new(hparams, options, device)
        .map_err(|e| anyhow::anyhow!("failed to initialise training: {e}"))?;
    match trainer
        .run()
        .map_err(|e| anyhow::anyhow!("training failed: {e}"))?
    {
        TrainOutcome::Completed { step } => tracing::info!(step, "training complete"),
        TrainOutcome::BudgetReached { step } => tracing::info!(step, "step budget reached"),
    }

    Ok(())
}
