#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use weather_relay::bus::RedisBus;
use weather_relay::{Dataset, PipelineConfig, Streamer};

#[derive(Parser)]
#[command(
    name = "weather-streamer",
    about = "Publishes the weather dataset as batched hour windows and serves replay requests"
)]
struct Args {
    /// Path to a TOML config file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = PipelineConfig::load(args.config.as_deref())?;
    let dataset = Arc::new(Dataset::from_csv_path(Path::new(&config.dataset_path))?);
    tracing::info!(records = dataset.len(), path = %config.dataset_path, "dataset loaded");

    let bus = Arc::new(RedisBus::connect(&config.redis_url)?);
    let streamer = Streamer::new(bus, dataset, config);

    let handle = streamer.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested, draining outbound queue");
            handle.request_shutdown();
        }
    });

    streamer.run().await;
    Ok(())
}
