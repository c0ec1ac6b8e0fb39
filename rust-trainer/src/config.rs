use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::Serialize;

use crate::dataset::DatasetKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DecayMode {
    /// Apply the schedule once per epoch, indexed by epoch.
    Epoch,
    /// Apply the schedule at every optimizer step, indexed by global step.
    Step,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeviceArg {
    Auto,
    Cpu,
    Cuda,
}

#[derive(Debug, Clone, Serialize, Parser)]
#[command(
    name = "pixelcnn-pp-rs",
    version,
    about = "Train a PixelCNN++ generative image model using Candle"
)]
pub struct TrainConfig {
    #[arg(short = 'e', long, default_value_t = 75, help = "Number of training epochs")]
    pub epochs: usize,

    #[arg(short = 'b', long, default_value_t = 64, help = "Training batch size")]
    pub batch: usize,

    #[arg(
        long,
        visible_alias = "bf",
        default_value_t = 1024,
        help = "Buffer size for shuffling"
    )]
    pub buffer: usize,

    #[arg(
        short = 'd',
        long,
        default_value = "mnist",
        help = "Dataset: mnist, fashion_mnist or cifar10"
    )]
    pub dataset: String,

    #[arg(
        long = "learning-rate",
        visible_aliases = ["lr", "learning_rate"],
        default_value_t = 1e-3,
        help = "Learning rate"
    )]
    pub learning_rate: f64,

    #[arg(
        long = "lr-decay",
        visible_aliases = ["dc", "lr_decay"],
        default_value_t = 0.999995,
        help = "Learning rate decay"
    )]
    pub lr_decay: f64,

    #[arg(
        short = 'c',
        long,
        default_value_t = false,
        help = "Enable contextual training"
    )]
    pub context: bool,

    #[arg(
        long = "hidden-dim",
        visible_aliases = ["hd", "hidden_dim"],
        default_value_t = 64,
        help = "Hidden dimension"
    )]
    pub hidden_dim: usize,

    #[arg(
        short = 'n',
        long = "n-res",
        visible_alias = "n_res",
        default_value_t = 4,
        help = "Number of res blocks per downsampling step"
    )]
    pub n_res: usize,

    #[arg(
        long,
        visible_alias = "ds",
        default_value_t = 2,
        help = "Number of downsampling steps"
    )]
    pub downsampling: usize,

    #[arg(
        short = 'm',
        long = "n-mix",
        visible_alias = "n_mix",
        default_value_t = 5,
        help = "Number of components in logistic mix"
    )]
    pub n_mix: usize,

    #[arg(short = 'p', long, default_value_t = 0.5, help = "Dropout rate")]
    pub dropout: f64,

    #[arg(long, value_enum, default_value_t = DecayMode::Epoch)]
    pub decay_mode: DecayMode,

    #[arg(long, help = "Directory holding the raw dataset files [default: ./data/<dataset>]")]
    pub data_dir: Option<String>,

    #[arg(long, default_value = "./logs/pixelcnn++")]
    pub log_root: String,

    #[arg(long)]
    pub run_name: Option<String>,

    #[arg(long, value_enum, default_value_t = DeviceArg::Auto)]
    pub device: DeviceArg,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, default_value_t = 8, help = "Samples per row of the sample grid")]
    pub nex: usize,

    #[arg(long, default_value_t = 1, help = "Plot samples every N epochs (0 disables)")]
    pub sample_every: usize,

    #[arg(long, default_value_t = 50)]
    pub log_every_batches: usize,

    #[arg(long, default_value_t = 0, help = "Truncate the train split (0 keeps all)")]
    pub max_train_examples: usize,

    #[arg(long, default_value_t = 0, help = "Truncate the test split (0 keeps all)")]
    pub max_test_examples: usize,
}

impl TrainConfig {
    pub fn dataset_kind(&self) -> anyhow::Result<DatasetKind> {
        self.dataset.parse()
    }

    pub fn data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from("data").join(&self.dataset),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.dataset_kind()?;
        if self.epochs == 0 {
            anyhow::bail!("--epochs must be > 0");
        }
        if self.batch == 0 {
            anyhow::bail!("--batch must be > 0");
        }
        if self.buffer == 0 {
            anyhow::bail!("--buffer must be > 0");
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            anyhow::bail!(
                "--learning-rate must be a positive number, got {}",
                self.learning_rate
            );
        }
        if !(self.lr_decay > 0.0 && self.lr_decay <= 1.0) {
            anyhow::bail!("--lr-decay must be in (0, 1], got {}", self.lr_decay);
        }
        if !(0.0..1.0).contains(&self.dropout) {
            anyhow::bail!("--dropout must be in [0, 1), got {}", self.dropout);
        }
        if self.hidden_dim == 0 {
            anyhow::bail!("--hidden-dim must be > 0");
        }
        if self.n_res == 0 {
            anyhow::bail!("--n-res must be > 0");
        }
        if self.n_mix == 0 {
            anyhow::bail!("--n-mix must be > 0");
        }
        Ok(())
    }
}
