use std::env;
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vitaldb::admission::AdmissionRegistry;
use vitaldb::api::RestApi;
use vitaldb::config::{load_config, ConfigSource, LoggingConfig};
use vitaldb::service::ResultService;
use vitaldb::storage::StorageEngine;

const CONFIG_ENV: &str = "VITALDB_CONFIG";

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config_path = env::var(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.yaml"));
    let (config, source) = load_config(&config_path)?;
    init_logging(&config.logging);
    if source == ConfigSource::Defaults {
        warn!(path = %config_path.display(), "config file not found, using defaults");
    }

    info!(
        config = %config_path.display(),
        storage = config.storage.path.as_deref().unwrap_or("<memory>"),
        batch_policy = ?config.batch_policy,
        "starting VitalDB"
    );

    let storage = Arc::new(StorageEngine::new(&config.storage)?);
    let admissions = Arc::new(AdmissionRegistry::from_seeds(&config.admissions));
    let service = Arc::new(ResultService::new(
        storage.clone(),
        admissions,
        config.batch_policy,
    ));
    let api = RestApi::new(service);

    let addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port).parse()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (bound, server) = warp::serve(api.routes()).try_bind_with_graceful_shutdown(addr, async move {
        shutdown_rx.await.ok();
        info!("shutting down server");
    })?;
    info!(%bound, "server listening");

    let server_handle = tokio::spawn(server);

    signal::ctrl_c().await?;
    info!("Ctrl+C received, starting graceful shutdown");
    shutdown_tx.send(()).ok();

    server_handle.await?;

    match storage.flush_all() {
        Ok(()) => info!("result log flushed"),
        Err(e) => error!(error = %e, "failed to flush result log"),
    }

    info!("server shutdown complete");
    Ok(())
}
