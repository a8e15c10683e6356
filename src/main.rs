//! Dashboard daemon binary.

use cachemgr::config::DashboardConfig;
use cachemgr::gslb::HttpGslbClient;
use cachemgr::mapper::{
    StoreGroupMapper, StoreGslbMapper, StoreSentinelMapper, StoreTemplateFileMapper,
    StoreTopomMapper,
};
use cachemgr::redis::PooledRedisOps;
use cachemgr::service::{new_sentinel_factory, Service};
use cachemgr::store::new_store;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "cachemgr")]
#[command(about = "Control-plane dashboard for a Redis-compatible storage fleet")]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long)]
    config: PathBuf,
}

fn init_logging(config: &DashboardConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if config.log_file_path.is_empty() {
        registry.with(fmt::layer()).try_init()?;
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_file_path)?;
        registry
            .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
            .try_init()?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Arc::new(DashboardConfig::from_file(&args.config)?);
    init_logging(&config)?;
    info!(product = %config.product_name, "starting dashboard");

    let store = new_store(
        &config.coordinator_name,
        &config.coordinator_addr,
        &config.coordinator_auth,
        Duration::from_secs(60),
    )
    .await?;

    let topom_mapper = Arc::new(StoreTopomMapper::new(
        &config.product_name,
        &config.admin_addr,
        store.clone(),
    ));
    let group_mapper = Arc::new(StoreGroupMapper::new(&config.product_name, store.clone()).await?);
    let sentinel_mapper =
        Arc::new(StoreSentinelMapper::new(&config.product_name, store.clone()).await?);
    let gslb_mapper = Arc::new(StoreGslbMapper::new(&config.product_name, store.clone()).await?);
    let tf_mapper = Arc::new(
        StoreTemplateFileMapper::new(
            store.clone(),
            &config.template_file_scan_dir,
            config.template_file_scan_interval,
        )
        .await?,
    );

    let redis = Arc::new(PooledRedisOps::new(
        &config.product_auth,
        Duration::from_secs(5),
        Duration::from_secs(10),
    ));
    let gslb_probe = Arc::new(HttpGslbClient::new());
    let sentinel_factory = new_sentinel_factory(&config.product_name, &config.product_auth);

    let service = Service::new(
        config.clone(),
        topom_mapper,
        group_mapper,
        sentinel_mapper,
        gslb_mapper,
        tf_mapper.clone(),
        redis,
        gslb_probe,
        sentinel_factory,
    );
    service.start().await?;

    // The admin server and the signal handler race; either ends the
    // process through the same orderly close path.
    let shutdown = CancellationToken::new();
    let server = {
        let service = service.clone();
        let shutdown = shutdown.clone();
        let addr = config.admin_addr.clone();
        tokio::spawn(async move { cachemgr::api::serve(service, &addr, shutdown).await })
    };

    tokio::select! {
        _ = wait_for_signal() => {
            info!("shutdown signal received");
        }
        result = server => {
            match result {
                Ok(Ok(())) => info!("admin server stopped"),
                Ok(Err(e)) => {
                    error!(error = %e, "admin server failed");
                    shutdown.cancel();
                    let _ = service.close().await;
                    tf_mapper.close();
                    let _ = store.close().await;
                    return Err(e.into());
                }
                Err(e) => error!(error = %e, "admin server task panicked"),
            }
        }
    }

    shutdown.cancel();
    if let Err(e) = service.close().await {
        error!(error = %e, "service close failed");
    }
    tf_mapper.close();
    let _ = store.close().await;
    info!("dashboard stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
