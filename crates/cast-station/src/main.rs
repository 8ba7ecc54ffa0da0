use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use cast_proto::config::StationConfig;
use cast_station::assets::AssetLibrary;
use cast_station::decoder::FfmpegDecoderFactory;
use cast_station::dj::{DjCore, DjListener, QueueHandle};
use cast_station::engine::PlayoutEngine;
use cast_station::queue::PlayoutQueue;
use cast_station::rotation::LibraryRotation;
use cast_station::sink::{SocketSink, TowerControl};
use cast_station::status::StatusListener;

/// Bounded wait for the terminal segment after draining begins.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,cast_station=debug")),
        )
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = StationConfig::load(config_path.as_deref())?;
    info!(socket = %config.socket_path.display(), "station config loaded");

    // Leaves first: rotation → assets → queue → DJ → engine.
    let rotation = LibraryRotation::new(&config.music_dir, &config.rotation_state_file);
    if rotation.track_count() == 0 {
        warn!(dir = %config.music_dir.display(), "music library is empty");
    }
    let assets = AssetLibrary::new(&config.dj_asset_dir);
    let queue = Arc::new(PlayoutQueue::new());

    let dj = Arc::new(Mutex::new(DjCore::new(
        config.dj.clone(),
        Box::new(rotation),
        assets,
        QueueHandle::new(queue.clone()),
        config.strict_queue_asserts,
    )));

    let telemetry = config
        .tower_control_url
        .as_deref()
        .map(TowerControl::new);
    let sink = Box::new(SocketSink::new(&config.socket_path));

    let mut engine = PlayoutEngine::new(
        queue,
        Arc::new(FfmpegDecoderFactory),
        sink,
        telemetry,
        config.strict_queue_asserts,
    );
    engine.add_listener(Arc::new(DjListener::new(dj.clone())));
    engine.add_listener(Arc::new(StatusListener::new()));
    let handle = engine.handle();

    // The startup announcement is injected directly as the active segment;
    // with none configured the first break is enqueued against the empty
    // queue before the loop starts.
    let startup_announcement = dj.lock().unwrap().take_startup_announcement();
    if startup_announcement.is_none() {
        dj.lock().unwrap().bootstrap_first_break()?;
    }

    let cancel = CancellationToken::new();
    let engine_task = tokio::spawn(engine.run(startup_announcement, cancel.clone()));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");
    handle.drain();
    dj.lock().unwrap().set_draining();

    tokio::select! {
        stopped = handle.wait_for_stopped(SHUTDOWN_WAIT) => {
            if !stopped {
                error!("playout did not stop within bound, aborting");
                cancel.cancel();
            }
        }
        _ = wait_for_shutdown_signal() => {
            warn!("second signal, terminating immediately");
            cancel.cancel();
        }
    }

    match engine_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("playout engine error: {e}"),
        Err(e) => error!("playout task panicked: {e}"),
    }
    info!("station stopped");
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
