use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use vpid_kv_cache::config::{Cli, Config};
use vpid_kv_cache::engine::stub::StubEngine;
use vpid_kv_cache::metrics::Metrics;
use vpid_kv_cache::storage::disk::DiskStorage;
use vpid_kv_cache::{server, VpidService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    info!("vpid-kv-cache v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);

    info!(
        listen = config.server.listen,
        storage = %config.storage.path.display(),
        hot_capacity = config.tiers.hot_capacity_bytes,
        warm_capacity = config.tiers.warm_capacity_bytes,
        admission = ?config.eviction.admission,
        pressure = ?config.eviction.pressure,
        "Configuration loaded"
    );

    let storage = DiskStorage::open(config.storage.path.clone())
        .await
        .with_context(|| format!("opening storage at {}", config.storage.path.display()))?;
    let engine = StubEngine::new(config.engine.clone());
    let metrics = Metrics::new().context("registering metrics")?;
    let listen = config.server.listen.clone();

    let service = Arc::new(VpidService::new(
        config,
        Arc::new(engine),
        Arc::new(storage),
        Arc::new(metrics),
    ));

    if let Err(e) = service.restore().await {
        warn!(error = %e, "Context restore failed; starting empty");
    }
    let sweeper = service.spawn_sweeper();

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    server::serve(listener, service.clone(), shutdown_signal()).await?;

    info!("Shutting down");
    sweeper.shutdown().await;
    service.shutdown().await;

    Ok(())
}

fn init_tracing(cli: &Cli) {
    let default_filter = if cli.verbose {
        "vpid_kv_cache=debug,tower_http=debug"
    } else {
        "vpid_kv_cache=info,tower_http=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
