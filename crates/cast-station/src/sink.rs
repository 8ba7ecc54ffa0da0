//! PCM egress toward Tower.
//!
//! The wire is an unframed concatenation of 4096-byte frames over a unix
//! stream socket. Writes are fire-and-forget at this end: a write that cannot
//! complete within one frame period tears the connection down, frames are
//! dropped while disconnected, and reconnection is retried in the background
//! of the next writes.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use cast_proto::frame::frame_period;
use cast_proto::wire::BufferStatus;

#[async_trait]
pub trait PcmSink: Send {
    /// Deliver one frame. Never fails upward; transport trouble is the
    /// sink's own problem.
    async fn write_frame(&mut self, frame: &[u8]);
}

pub struct SocketSink {
    path: PathBuf,
    stream: Option<UnixStream>,
    last_attempt: Option<Instant>,
    frames_dropped: u64,
}

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

impl SocketSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stream: None,
            last_attempt: None,
            frames_dropped: 0,
        }
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    async fn ensure_connected(&mut self) -> bool {
        if self.stream.is_some() {
            return true;
        }
        if let Some(at) = self.last_attempt {
            if at.elapsed() < RECONNECT_BACKOFF {
                return false;
            }
        }
        self.last_attempt = Some(Instant::now());
        match UnixStream::connect(&self.path).await {
            Ok(stream) => {
                info!(path = %self.path.display(), "pcm socket connected");
                self.stream = Some(stream);
                true
            }
            Err(e) => {
                debug!(path = %self.path.display(), "pcm socket connect failed: {e}");
                false
            }
        }
    }
}

#[async_trait]
impl PcmSink for SocketSink {
    async fn write_frame(&mut self, frame: &[u8]) {
        if !self.ensure_connected().await {
            self.frames_dropped += 1;
            return;
        }
        let stream = self.stream.as_mut().expect("connected above");
        // Transient pipe-full conditions get one frame period to clear;
        // anything slower counts as a persistent failure.
        match tokio::time::timeout(frame_period(), stream.write_all(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("pcm socket write failed, reconnecting: {e}");
                self.stream = None;
                self.frames_dropped += 1;
            }
            Err(_) => {
                warn!("pcm socket write timed out, reconnecting");
                self.stream = None;
                self.frames_dropped += 1;
            }
        }
    }
}

// ── Tower telemetry ───────────────────────────────────────────────────────────

/// Polls Tower's `/tower/buffer` endpoint for adaptive pacing, at most once
/// per 500 ms. No telemetry (error, timeout, unset URL) reads as None and the
/// pacer falls back to the nominal period.
pub struct TowerControl {
    client: reqwest::Client,
    buffer_url: String,
    cache: tokio::sync::Mutex<TelemetryCache>,
}

#[derive(Default)]
struct TelemetryCache {
    polled_at: Option<Instant>,
    fill: Option<(usize, usize)>,
}

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const POLL_TIMEOUT: Duration = Duration::from_millis(300);

impl TowerControl {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(POLL_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            buffer_url: format!("{}/tower/buffer", base_url.trim_end_matches('/')),
            cache: tokio::sync::Mutex::new(TelemetryCache::default()),
        }
    }

    pub async fn buffer_fill(&self) -> Option<(usize, usize)> {
        let mut cache = self.cache.lock().await;
        if let Some(at) = cache.polled_at {
            if at.elapsed() < POLL_INTERVAL {
                return cache.fill;
            }
        }
        cache.polled_at = Some(Instant::now());
        cache.fill = match self.client.get(&self.buffer_url).send().await {
            Ok(resp) => match resp.json::<BufferStatus>().await {
                Ok(status) => Some((status.fill, status.capacity)),
                Err(e) => {
                    debug!("buffer telemetry unparsable: {e}");
                    None
                }
            },
            Err(e) => {
                debug!("buffer telemetry unavailable: {e}");
                None
            }
        };
        cache.fill
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn drops_frames_while_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SocketSink::new(dir.path().join("nobody-listening.sock"));
        sink.write_frame(&[0u8; 16]).await;
        sink.write_frame(&[0u8; 16]).await;
        assert_eq!(sink.frames_dropped(), 2);
    }

    #[tokio::test]
    async fn delivers_frames_once_connected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pcm.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let mut sink = SocketSink::new(&path);
        let frame = vec![7u8; 64];
        sink.write_frame(&frame).await;

        let (mut peer, _) = listener.accept().await.unwrap();
        // The first frame may have raced the accept; send another.
        sink.write_frame(&frame).await;

        let mut buf = vec![0u8; 64];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, frame);
    }
}
