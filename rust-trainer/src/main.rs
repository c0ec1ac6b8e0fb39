mod callbacks;
mod config;
mod dataset;
mod model;
mod pipeline;
mod preview;
mod schedule;
mod summary;
mod train;

use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if cfg!(debug_assertions) {
        tracing::warn!(
            "Running a debug build. Training can be much slower. Use `cargo run --release ...`."
        );
    }
    let cfg = config::TrainConfig::parse();
    train::run_training(&cfg)
}
