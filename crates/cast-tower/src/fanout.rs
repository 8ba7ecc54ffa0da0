//! HTTP fan-out: `/stream` broadcast plus the status and control plane.
//!
//! Each listener gets a bounded per-client buffer sized from
//! `client_buffer_bytes`. The broadcast loop delivers chunks with a
//! non-blocking send per client; a client whose buffer stays full past
//! `client_timeout_ms` is evicted, and a disconnected client is removed at
//! the boundary. Fast clients never lose bytes and never wait on slow ones.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use cast_proto::wire::{BufferStatus, SourceCommand, SourceMode, TowerStatus};

use crate::encoder::EncoderManager;
use crate::router::PcmInputRouter;
use crate::source::{SourceError, SourceManager};

// ── Client registry ───────────────────────────────────────────────────────────

struct Client {
    id: u64,
    tx: mpsc::Sender<Vec<u8>>,
    /// When the client's buffer first refused a chunk; cleared on success.
    full_since: Option<Instant>,
}

pub struct ClientRegistry {
    clients: Mutex<Vec<Client>>,
    next_id: AtomicU64,
    buffer_chunks: usize,
    timeout: Duration,
}

impl ClientRegistry {
    pub fn new(client_buffer_bytes: usize, chunk_bytes: usize, timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            buffer_chunks: (client_buffer_bytes / chunk_bytes.max(1)).max(1),
            timeout,
        }
    }

    /// Register a listener; the returned receiver feeds its response body.
    pub fn add_client(&self) -> (u64, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(self.buffer_chunks);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut clients = self.clients.lock().unwrap();
        clients.push(Client {
            id,
            tx,
            full_since: None,
        });
        info!(client = id, total = clients.len(), "stream client connected");
        (id, rx)
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Deliver one chunk to every client without blocking on any of them.
    pub fn broadcast(&self, chunk: &[u8]) {
        let timeout = self.timeout;
        let mut clients = self.clients.lock().unwrap();
        clients.retain_mut(|client| {
            match client.tx.try_send(chunk.to_vec()) {
                Ok(()) => {
                    client.full_since = None;
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    info!(client = client.id, "stream client disconnected");
                    false
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Buffer exhausted; give it the write timeout to drain.
                    match client.full_since {
                        None => {
                            client.full_since = Some(Instant::now());
                            true
                        }
                        Some(since) if since.elapsed() >= timeout => {
                            info!(client = client.id, "slow client evicted");
                            false
                        }
                        Some(_) => true,
                    }
                }
            }
        });
    }

    pub fn close_all(&self) {
        self.clients.lock().unwrap().clear();
    }
}

// ── HTTP surface ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct HttpState {
    pub registry: Arc<ClientRegistry>,
    pub encoder: Arc<EncoderManager>,
    pub sources: Arc<SourceManager>,
    pub router: Arc<PcmInputRouter>,
    pub started_at: Instant,
}

pub fn http_router(state: HttpState) -> Router {
    Router::new()
        .route("/stream", get(stream_handler))
        .route("/status", get(status_handler))
        .route("/tower/buffer", get(buffer_handler))
        .route("/control/source", post(control_source_handler))
        .fallback(|| async { (StatusCode::NOT_FOUND, "Not Found") })
        .with_state(state)
}

async fn stream_handler(State(state): State<HttpState>) -> Response {
    let (id, rx) = state.registry.add_client();
    debug!(client = id, "stream body opened");

    let body = Body::from_stream(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<_, std::convert::Infallible>(chunk), rx))
    }));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "audio/mpeg")
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .expect("static stream headers")
}

async fn status_handler(State(state): State<HttpState>) -> Json<TowerStatus> {
    let (source_mode, file_path) = state.sources.current();
    Json(TowerStatus {
        source_mode,
        file_path: file_path.map(|p| p.display().to_string()),
        num_clients: state.registry.client_count(),
        encoder_running: state.encoder.is_running(),
        uptime_seconds: state.started_at.elapsed().as_secs_f64(),
        router_queue: Some(state.router.stats()),
    })
}

async fn buffer_handler(State(state): State<HttpState>) -> Json<BufferStatus> {
    Json(state.router.stats())
}

async fn control_source_handler(
    State(state): State<HttpState>,
    body: Result<Json<SourceCommand>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Json(command) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, &rejection.body_text());
        }
    };

    if command.mode == SourceMode::File && command.file_path.is_none() {
        return error_response(StatusCode::BAD_REQUEST, "file_path is required for 'file' mode");
    }

    let file_path = command.file_path.as_deref().map(Path::new);
    match state.sources.switch(command.mode, file_path) {
        Ok(()) => {
            let (mode, path) = state.sources.current();
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "source_mode": mode,
                    "file_path": path.map(|p| p.display().to_string()),
                })),
            )
                .into_response()
        }
        Err(e @ SourceError::Io { .. }) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "status": "error", "error": message })),
    )
        .into_response()
}

// ── Broadcast loop ────────────────────────────────────────────────────────────

/// Pull MP3 chunks and fan them out. The jitter buffer paces the reads while
/// the encoder runs; during outages the silent chunk comes back immediately,
/// so the loop holds the cadence itself and clients keep receiving bytes.
pub async fn run_broadcast(
    registry: Arc<ClientRegistry>,
    encoder: Arc<EncoderManager>,
    chunk_bytes: usize,
    read_interval: Duration,
    cancel: CancellationToken,
) {
    info!("broadcast loop started");
    while !cancel.is_cancelled() {
        let chunk = encoder.get_chunk(chunk_bytes).await;
        registry.broadcast(&chunk);

        if !encoder.is_running() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(read_interval) => {}
            }
        }
    }
    registry.close_all();
    info!("broadcast loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_client_evicted_fast_client_unharmed() {
        let registry = ClientRegistry::new(4 * 64, 64, Duration::from_millis(0));
        let (_slow_id, slow_rx) = registry.add_client();
        let (_fast_id, mut fast_rx) = registry.add_client();
        assert_eq!(registry.client_count(), 2);

        // The slow client never drains; four chunks fill its buffer, the
        // fifth marks it full, the sixth (timeout 0) evicts it.
        for _ in 0..6 {
            registry.broadcast(&[1u8; 64]);
            while fast_rx.try_recv().is_ok() {}
        }
        assert_eq!(registry.client_count(), 1);
        drop(slow_rx);

        // The fast client keeps receiving.
        registry.broadcast(&[2u8; 64]);
        assert_eq!(fast_rx.try_recv().unwrap(), vec![2u8; 64]);
    }

    #[test]
    fn full_buffer_gets_grace_before_eviction() {
        let registry = ClientRegistry::new(64, 64, Duration::from_secs(60));
        let (_id, _rx) = registry.add_client();

        // Fill the one-chunk buffer, then keep refusing: with a long timeout
        // the client survives.
        for _ in 0..5 {
            registry.broadcast(&[0u8; 64]);
        }
        assert_eq!(registry.client_count(), 1);
    }

    #[test]
    fn disconnected_client_removed_at_boundary() {
        let registry = ClientRegistry::new(1024, 64, Duration::from_millis(250));
        let (_id, rx) = registry.add_client();
        drop(rx);
        registry.broadcast(&[0u8; 64]);
        assert_eq!(registry.client_count(), 0);
    }
}
