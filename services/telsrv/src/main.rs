//! Telemetry gateway service entry point

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use telsrv::config::ServiceConfig;
use telsrv::directory::{DeviceDirectory, SqliteDirectorySource};
use telsrv::ingest::Gateway;
use telsrv::logging::init_logger;
use telsrv::protocols::hydro::HydroDecoderRegistry;
use telsrv::storage::store::{RedisValueCache, SqliteHistoryStore, ValueCache};
use telsrv::storage::writer::BatchWriter;

#[derive(Parser, Debug)]
#[command(name = "telsrv", about = "Hydrological telemetry gateway", version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/telsrv.yaml")]
    config: String,

    /// Log to console regardless of the configured log target
    #[arg(long)]
    console: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = ServiceConfig::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config))?;
    if args.check {
        println!("{} OK", args.config);
        return Ok(());
    }
    init_logger(
        &config.service.log_dir,
        &config.service.name,
        &config.service.log_level,
        config.service.console || args.console,
    )
    .context("initializing logger")?;
    info!(config = %args.config, "telsrv starting");

    let store = Arc::new(
        SqliteHistoryStore::connect(&config.storage.db_path)
            .await
            .context("opening history database")?,
    );

    let cache: Option<Arc<dyn ValueCache>> = match &config.storage.redis_url {
        Some(url) => Some(Arc::new(
            RedisValueCache::connect(url)
                .await
                .context("connecting to redis")?,
        )),
        None => None,
    };

    let source = SqliteDirectorySource::new(store.pool().clone());
    source
        .ensure_schema()
        .await
        .context("preparing directory schema")?;
    let directory = DeviceDirectory::new(
        Arc::new(source),
        std::time::Duration::from_secs(config.directory.reload_cooldown_secs),
    );

    let (writer, writer_task) = BatchWriter::spawn(
        store,
        cache,
        config.storage.batch_size,
        config.storage.flush_interval(),
        None,
    );

    // Proprietary decoders are registered here as they are developed
    let hydro = Arc::new(HydroDecoderRegistry::new());

    let gateway = Gateway::new(config, directory, writer, hydro);
    let gateway_task = tokio::spawn(gateway.run());

    tokio::select! {
        result = gateway_task => {
            match result {
                Ok(Ok(())) => info!("gateway stopped"),
                Ok(Err(e)) => error!("gateway failed: {e}"),
                Err(e) => error!("gateway task panicked: {e}"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    writer_task.abort();
    info!("telsrv stopped");
    Ok(())
}
