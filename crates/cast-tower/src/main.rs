use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use cast_proto::config::TowerConfig;
use cast_tower::service::TowerService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,cast_tower=debug")),
        )
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = TowerConfig::load(config_path.as_deref())?;
    info!(
        host = %config.host,
        port = config.port,
        socket = %config.socket_path.display(),
        "tower config loaded"
    );

    let mut service = TowerService::start(config).await?;

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    service.stop().await;
    info!("tower stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
