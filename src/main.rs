use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use llama2_mtp::config::{DeviceKind, InitFrom, Precision, TrainConfig};
use llama2_mtp::export::{export_checkpoint, ExportVersion};
use llama2_mtp::Trainer;

#[derive(Parser)]
#[command(
    name = "llama2-mtp",
    about = "Train Llama 2 style models with multi-token prediction heads"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train (or resume, or only evaluate) a model.
    Train(TrainArgs),
    /// Write the latest checkpoint as a llama2.c `.bin` file.
    Export {
        /// Directory holding `model_*.safetensors` and `meta_*.json`.
        #[arg(long, default_value = "out")]
        checkpoint_dir: PathBuf,
        #[arg(long, default_value = "out/model.bin")]
        output: PathBuf,
        #[arg(long, default_value = "0")]
        version: ExportVersion,
    },
    /// Write the default training config as JSON.
    InitConfig {
        #[arg(default_value = "train_config.json")]
        path: PathBuf,
    },
}

/// Command line values override the config file.
#[derive(Args)]
struct TrainArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    out_dir: Option<PathBuf>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    max_iters: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f64>,
    #[arg(long)]
    n_future: Option<usize>,
    #[arg(long)]
    mtp_loss_weight: Option<f64>,
    /// auto, cpu, metal, cuda or cuda:N
    #[arg(long)]
    device: Option<DeviceKind>,
    /// f32, bf16 or f16
    #[arg(long)]
    precision: Option<Precision>,
    #[arg(long)]
    eval_only: bool,
    /// Continue from the latest checkpoint in the output directory.
    #[arg(long)]
    resume: bool,
}

impl TrainArgs {
    fn into_config(self) -> Result<TrainConfig> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::from_file(path)?,
            None => TrainConfig::default(),
        };
        if let Some(v) = self.out_dir {
            config.out_dir = v;
        }
        if let Some(v) = self.data_dir {
            config.data_dir = v;
        }
        if let Some(v) = self.max_iters {
            config.max_iters = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.learning_rate {
            config.learning_rate = v;
        }
        if let Some(v) = self.n_future {
            config.n_future = v;
        }
        if let Some(v) = self.mtp_loss_weight {
            config.mtp_loss_weight = v;
        }
        if let Some(v) = self.device {
            config.device = v;
        }
        if let Some(v) = self.precision {
            config.precision = v;
        }
        config.eval_only |= self.eval_only;
        if self.resume {
            config.init_from = InitFrom::Resume;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Train(args) => {
            let config = args.into_config()?;
            config.validate()?;
            config.save(&config.out_dir.join("config.json"))?;
            let mut trainer = Trainer::new(config)?;
            trainer.run()?;
            info!(best_val_loss = trainer.best_val_loss(), "done");
        }
        Commands::Export {
            checkpoint_dir,
            output,
            version,
        } => export_checkpoint(&checkpoint_dir, &output, version)?,
        Commands::InitConfig { path } => {
            TrainConfig::default().save(&path)?;
            info!(path = %path.display(), "wrote default config");
        }
    }
    Ok(())
}
