//! Tower service wiring.
//!
//! Builds the components leaves-first (ring buffers → fallback sources →
//! input router → encoder manager → pump → fan-out → HTTP), shares one
//! cancellation token, and tears everything down in order on stop.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cast_proto::config::TowerConfig;

use crate::encoder::EncoderManager;
use crate::fanout::{self, ClientRegistry, HttpState};
use crate::pump;
use crate::ring::RingBuffer;
use crate::router::PcmInputRouter;
use crate::silent;
use crate::source::SourceManager;

pub struct TowerService {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    pub router: Arc<PcmInputRouter>,
    pub encoder: Arc<EncoderManager>,
    pub sources: Arc<SourceManager>,
    pub registry: Arc<ClientRegistry>,
    pub local_addr: std::net::SocketAddr,
}

impl TowerService {
    pub async fn start(config: TowerConfig) -> anyhow::Result<Self> {
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let sources = Arc::new(SourceManager::new(
            config.tone_frequency,
            config.default_source,
            config.default_file_path.as_deref(),
        )?);

        let router = Arc::new(PcmInputRouter::new(
            &config.socket_path,
            config.pcm_ring_capacity,
            Duration::from_secs(config.router_idle_timeout_sec),
        ));
        router.start(cancel.clone())?;

        let silent_chunk =
            silent::generate_silent_chunk(&config.bitrate, config.encoder_target_chunk_rate.max(1024))
                .await;
        let mp3_ring = Arc::new(RingBuffer::new(config.mp3_ring_capacity));
        let encoder = EncoderManager::new(config.clone(), mp3_ring, silent_chunk);
        tasks.push(encoder.clone().run_supervisor(cancel.clone()));

        tasks.push(tokio::spawn(pump::run_audio_pump(
            router.clone(),
            sources.clone(),
            encoder.clone(),
            Duration::from_secs(config.pcm_grace_sec),
            cancel.clone(),
        )));

        let registry = Arc::new(ClientRegistry::new(
            config.client_buffer_bytes,
            config.encoder_target_chunk_rate,
            Duration::from_millis(config.client_timeout_ms),
        ));
        tasks.push(tokio::spawn(fanout::run_broadcast(
            registry.clone(),
            encoder.clone(),
            config.encoder_target_chunk_rate,
            Duration::from_millis(config.encoder_jitter_read_interval_ms),
            cancel.clone(),
        )));

        let state = HttpState {
            registry: registry.clone(),
            encoder: encoder.clone(),
            sources: sources.clone(),
            router: router.clone(),
            started_at: Instant::now(),
        };
        let app = fanout::http_router(state);
        let listener =
            tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "http listening");
        let http_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let shutdown = async move { http_cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!("http server error: {e}");
            }
        }));

        info!("tower service started");
        Ok(Self {
            cancel,
            tasks,
            router,
            encoder,
            sources,
            registry,
            local_addr,
        })
    }

    /// Idempotent. Signals every loop and waits a bounded time for each task
    /// to reach its next blocking boundary.
    pub async fn stop(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!("stopping tower service");
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("task did not stop within bound");
            }
        }
        self.registry.close_all();
        info!("tower service stopped");
    }
}
