use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::info;

use peleenet_profiler::train::{run, TrainConfig};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match env::args().nth(1).map(PathBuf::from) {
        Some(path) => TrainConfig::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            info!("no config file given; using defaults");
            TrainConfig::default()
        }
    };

    let summary = run(&config)?;
    info!(
        "done: {} epochs, best Acc@1 {:.3}, {} layers traced",
        summary.epochs_run, summary.best_acc1, summary.traced_layers
    );
    Ok(())
}
