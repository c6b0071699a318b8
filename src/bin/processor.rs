#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use weather_relay::bus::RedisBus;
use weather_relay::store::InfluxStore;
use weather_relay::{PipelineConfig, Processor};

#[derive(Parser)]
#[command(
    name = "weather-processor",
    about = "Computes hourly region averages and station extremes for completed windows"
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

    let bus = Arc::new(RedisBus::connect(&config.redis_url)?);
    let store = Arc::new(InfluxStore::new(&config.influx));
    let processor = Processor::new(bus, store, config);

    let handle = processor.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested, draining retry queue");
            handle.request_shutdown();
        }
    });

    processor.run().await;
    Ok(())
}
