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
use weather_relay::{Ingester, PipelineConfig};

#[derive(Parser)]
#[command(
    name = "weather-ingester",
    about = "Reassembles batched hour windows and flushes complete ones to the time-series store"
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
    let ingester = Ingester::new(bus, store, config);

    let handle = ingester.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested, letting in-flight flushes finish");
            handle.request_shutdown();
        }
    });

    ingester.run().await;
    Ok(())
}
