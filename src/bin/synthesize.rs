//! Synthesize mel spectrograms from text with a trained checkpoint.
//!
//! # Output
//!
//! For each `--text`, writes `mel-<i>.npy` (`[T, 80]`, values in `[-1, 1]`)
//! to `--output-dir`, plus `alignment-<i>.npy` with `--alignments` and a
//! Griffin-Lim `wav-<i>.wav` with `--griffin-lim`. Prints one JSON line per
//! utterance to stdout:
//!
//! ```json
//! {"index":1,"frames":212,"decoder_steps":106,"stop_reason":"threshold","mel":"out/mel-1.npy"}
//! ```

use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use clap::Parser;
use tacotron_rs::audio::write_wav;
use tacotron_rs::config::HParams;
use tacotron_rs::synthesizer::Synthesizer;

#[derive(Parser, Debug)]
#[command(
    name = "synthesize",
    about = "Generate mel spectrograms from text and a speaker embedding"
)]
struct Args {
    /// Checkpoint written by synthesizer-train.
    #[arg(long, short = 'c')]
    checkpoint: PathBuf,

    /// Text to synthesize. Repeat for several utterances.
    #[arg(long, short = 't', required = true)]
    text: Vec<String>,

    /// Speaker embedding `.npy`, `[256]` (shared by every text) or `[N, 256]`.
    #[arg(long, short = 'e')]
    embedding: PathBuf,

    #[arg(long, short = 'o', default_value = "synthesized")]
    output_dir: PathBuf,

    /// Also write the attention alignment of each utterance.
    #[arg(long)]
    alignments: bool,

    /// Also render each mel to audio with Griffin-Lim.
    #[arg(long)]
    griffin_lim: bool,

    /// JSON file overriding the default hyper-parameters.
    #[arg(long)]
    hparams: Option<PathBuf>,

    /// Disable pre-net dropout for reproducible output.
    #[arg(long)]
    deterministic: bool,

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

    let mut hparams = match &args.hparams {
        Some(path) => HParams::from_json_file(path)
            .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", path.display()))?,
        None => HParams::default(),
    };
    if args.deterministic {
        hparams.inference.prenet_dropout = false;
    }

    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };

    let embedding = Tensor::read_npy(&args.embedding)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", args.embedding.display()))?
        .to_dtype(DType::F32)?;
    // A single embedding voices every text.
    let embeddings = if embedding.rank() == 1 {
        embedding
            .unsqueeze(0)?
            .repeat((args.text.len(), 1))?
    } else {
        embedding
    };

    std::fs::create_dir_all(&args.output_dir)?;

    let synthesizer = Synthesizer::load(&args.checkpoint, hparams, device)
        .map_err(|e| anyhow::anyhow!("failed to load synthesizer: {e}"))?;
    let outputs = synthesizer
        .synthesize_spectrograms(&args.text, &embeddings, args.alignments)
        .map_err(|e| anyhow::anyhow!("synthesis failed: {e}"))?;

    for (i, output) in outputs.iter().enumerate() {
        let index = i + 1;
        let mel_path = args.output_dir.join(format!("mel-{index}.npy"));
        output.mel.t()?.contiguous()?.write_npy(&mel_path)?;

        if let Some(alignment) = &output.alignment {
            alignment.write_npy(args.output_dir.join(format!("alignment-{index}.npy")))?;
        }
        if args.griffin_lim {
            let wav = synthesizer.griffin_lim(&output.mel)?;
            write_wav(
                args.output_dir.join(format!("wav-{index}.wav")),
                &wav,
                synthesizer.sample_rate(),
            )?;
        }

        let mut summary = serde_json::to_value(output.summary(index)?)?;
        summary["mel"] = serde_json::Value::String(mel_path.display().to_string());
        println!("{summary}");
    }

    Ok(())
}
