//! Training run utilities
//!
//! Work on the files a ToucanTTS training run leaves behind, and inspect
//! vocoder training data.
//!
//! # Usage
//!
//! ```bash
//! # Average the 3 newest checkpoints into best.safetensors
//! cargo run --example toucan_tools --release -- average -d checkpoints -n 3
//!
//! # Keep only the 5 newest checkpoints
//! cargo run --example toucan_tools --release -- prune -d checkpoints --keep 5
//!
//! # Write a config with all defaults
//! cargo run --example toucan_tools --release -- init-config -o train.yaml
//!
//! # Check a directory of vocoder training audio
//! cargo run --example toucan_tools --release -- vocoder-data -i wavs
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use toucan_mlx::audio::{MelConfig, MelSpectrogram};
use toucan_mlx::training::{
    average_checkpoints, delete_old_checkpoints, n_recent_checkpoint_paths, save_model_for_use,
    ToucanTrainingConfig, VocoderDataset, VocoderDatasetConfig, BEST_MODEL_FILE,
};

#[derive(Parser)]
#[command(name = "toucan_tools")]
#[command(about = "Checkpoint and data utilities for ToucanTTS training")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Average the newest checkpoints into an inference artifact
    Average {
        /// Checkpoint directory
        #[arg(short, long)]
        dir: PathBuf,

        /// Number of checkpoints to average
        #[arg(short, long, default_value = "1")]
        n: usize,

        /// Output file (default: <dir>/best.safetensors)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete all but the newest checkpoints
    Prune {
        #[arg(short, long)]
        dir: PathBuf,

        #[arg(long, default_value = "5")]
        keep: usize,
    },

    /// Write the default training config as YAML
    InitConfig {
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Load vocoder training audio and draw one sample per file
    VocoderData {
        /// Directory of WAV files
        #[arg(short, long)]
        input: PathBuf,

        /// Blur spectrograms at random
        #[arg(long)]
        corrupt: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Average { dir, n, output } => {
            let paths = n_recent_checkpoint_paths(&dir, n)?;
            info!("Averaging {} checkpoints", paths.len());
            for path in &paths {
                info!("  {}", path.display());
            }
            let artifact = average_checkpoints(&paths)?;
            let output = output.unwrap_or_else(|| dir.join(BEST_MODEL_FILE));
            save_model_for_use(&artifact, &output)?;
        }

        Commands::Prune { dir, keep } => {
            let removed = delete_old_checkpoints(&dir, keep)?;
            info!("Removed {} checkpoints", removed.len());
        }

        Commands::InitConfig { output } => {
            ToucanTrainingConfig::default().to_yaml(&output)?;
            info!("Wrote {}", output.display());
        }

        Commands::VocoderData { input, corrupt } => {
            let mut paths: Vec<PathBuf> = std::fs::read_dir(&input)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "wav"))
                .collect();
            paths.sort();

            let config = VocoderDatasetConfig {
                use_random_corruption: corrupt,
                ..Default::default()
            };
            let mel = MelSpectrogram::new(MelConfig::default())?;
            let mut dataset = VocoderDataset::from_paths(&paths, config, mel)?;

            for index in 0..dataset.len() {
                let sample = dataset.get(index)?;
                info!(
                    "[{}] segment {:?}, mel {:?}",
                    index,
                    sample.segment.shape(),
                    sample.mel.shape()
                );
            }
        }
    }

    Ok(())
}
