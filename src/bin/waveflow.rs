//! WaveFlow CLI: mel-spectrogram → waveform vocoding.
//!
//! # Subcommands
//!
//! - `init`: write freshly initialised weights
//! - `synthesize`: vocode a mel file (`.npy` / `.safetensors`) or the mel of
//!   a WAV file, write 16-bit mono WAV
//! - `score`: per-sample negative log-likelihood of a WAV file
//!
//! `synthesize` and `score` print a one-line JSON summary to stdout.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use waveflow_rs::{
    audio::{peak_normalize, read_wav, to_mono, write_wav},
    config::WaveFlowConfig,
    pipeline::{Vocoder, load_mel},
};

#[derive(Parser, Debug)]
#[command(name = "waveflow", about = "WaveFlow flow-based neural vocoder")]
struct Args {
    /// Model config (JSON). Omit for the 22.05 kHz LJSpeech defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write freshly initialised weights.
    Init {
        #[arg(long, short = 'o')]
        output: PathBuf,
    },

    /// Synthesize audio from a mel spectrogram.
    Synthesize {
        /// Weights (safetensors).
        #[arg(long, short = 'w')]
        weights: PathBuf,

        /// Mel spectrogram, `[M, F]` or `[B, M, F]`.
        #[arg(long, conflicts_with = "wav", required_unless_present = "wav")]
        mel: Option<PathBuf>,

        /// Vocode the mel of this WAV file instead.
        #[arg(long)]
        wav: Option<PathBuf>,

        /// Output WAV. Batch item `i > 0` goes to `<stem>-<i>.wav`.
        #[arg(long, short = 'o')]
        output: PathBuf,

        /// Latent standard deviation. Below 1.0 trades variety for cleaner audio.
        #[arg(long, default_value_t = 1.0)]
        sigma: f64,

        /// Random seed. Omit for fresh noise each run.
        #[arg(long, short = 's')]
        seed: Option<u64>,

        /// Peak-normalize before writing.
        #[arg(long)]
        normalize: bool,
    },

    /// Score a WAV file (nats per sample).
    Score {
        #[arg(long, short = 'w')]
        weights: PathBuf,

        #[arg(long)]
        wav: PathBuf,
    },
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
    let config = match &args.config {
        Some(path) => WaveFlowConfig::from_json_file(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?,
        None => WaveFlowConfig::default(),
    };

    let device = candle_core::Device::cuda_if_available(0)?;
    tracing::info!("Using device: {:?}", device);

    match args.command {
        Command::Init { output } => {
            ensure_parent(&output)?;
            let vocoder = Vocoder::fresh(config, &device)?;
            vocoder.save(&output)?;
        }
        Command::Synthesize {
            weights,
            mel,
            wav,
            output,
            sigma,
            seed,
            normalize,
        } => {
            let vocoder = Vocoder::load(config, &weights, &device)
                .map_err(|e| anyhow::anyhow!("failed to load weights: {e}"))?;
            let mut outputs = match (mel, wav) {
                (Some(mel), _) => {
                    let mel = load_mel(&mel, &device)?;
                    vocoder.synthesize(&mel, sigma, seed)?
                }
                (None, Some(wav)) => {
                    let samples = read_model_wav(&wav, vocoder.config().sample_rate)?;
                    vec![vocoder.resynthesize(&samples, sigma, seed)?]
                }
                (None, None) => anyhow::bail!("one of --mel or --wav is required"),
            };

            ensure_parent(&output)?;
            for (i, audio) in outputs.iter_mut().enumerate() {
                if normalize {
                    peak_normalize(&mut audio.samples);
                }
                let path = batch_path(&output, i);
                write_wav(&path, &audio.samples, audio.sample_rate)
                    .map_err(|e| anyhow::anyhow!("failed to write audio: {e}"))?;
                println!(
                    r#"{{"path":"{path}","duration_s":{duration:.3},"sample_rate":{sr}}}"#,
                    path = path.display(),
                    duration = audio.duration_s(),
                    sr = audio.sample_rate,
                );
            }
        }
        Command::Score { weights, wav } => {
            let vocoder = Vocoder::load(config, &weights, &device)
                .map_err(|e| anyhow::anyhow!("failed to load weights: {e}"))?;
            let samples = read_model_wav(&wav, vocoder.config().sample_rate)?;
            let nll = vocoder.score(&samples)?;
            println!(
                r#"{{"path":"{path}","nll":{nll:.5},"samples":{n}}}"#,
                path = wav.display(),
                n = samples.len(),
            );
        }
    }
    Ok(())
}

/// Mono samples of `path`, which must already be at `sample_rate`.
fn read_model_wav(path: &Path, sample_rate: u32) -> anyhow::Result<Vec<f32>> {
    let (samples, sr, channels) = read_wav(path)?;
    if sr != sample_rate {
        anyhow::bail!(
            "{} is {sr} Hz, the model expects {sample_rate} Hz",
            path.display()
        );
    }
    Ok(to_mono(&samples, channels)?)
}

fn batch_path(output: &Path, index: usize) -> PathBuf {
    if index == 0 {
        return output.to_path_buf();
    }
    let stem = output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("out");
    output.with_file_name(format!("{stem}-{index}.wav"))
}

fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
