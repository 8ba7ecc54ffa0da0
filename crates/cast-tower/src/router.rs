//! PCM input router: one producer in, whole frames out.
//!
//! A unix-socket listener accepts exactly one producer at a time; a second
//! connection is refused immediately. The reader reassembles the unframed
//! byte stream into 4096-byte frames and publishes them to a bounded ring.
//! An idle watchdog marks the router dead after a configurable silence and
//! clears the ring, but never closes the producer's socket, so the writer
//! keeps writing without seeing EPIPE and playback resumes the moment a new
//! complete frame arrives.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cast_proto::frame::FRAME_BYTES;
use cast_proto::wire::BufferStatus;

use crate::ring::RingBuffer;

const READ_CHUNK: usize = 8192;
const REALIGN_CAP: usize = 16384;
const WATCHDOG_TICK: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Splits an arbitrary byte stream into whole frames.
///
/// The staging buffer is capped; complete frames are drained first and any
/// excess is aligned to a frame boundary before the oldest bytes go.
pub struct Reassembler {
    buf: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(data);

        let mut frames = Vec::new();
        while self.buf.len() >= FRAME_BYTES {
            let frame = self.buf.drain(..FRAME_BYTES).collect();
            frames.push(frame);
        }

        if self.buf.len() > REALIGN_CAP {
            // Misaligned flood; keep the newest frame-aligned tail.
            let excess = self.buf.len() - REALIGN_CAP;
            let aligned = excess.div_ceil(FRAME_BYTES) * FRAME_BYTES;
            let drop = aligned.min(self.buf.len());
            warn!(bytes = drop, "realign buffer overflow, discarding oldest");
            self.buf.drain(..drop);
        }
        frames
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

struct RouterState {
    connected: bool,
    dead: bool,
    last_frame: Instant,
    frames_received: u64,
}

pub struct PcmInputRouter {
    socket_path: PathBuf,
    ring: RingBuffer<Vec<u8>>,
    state: Mutex<RouterState>,
    idle_timeout: Duration,
}

impl PcmInputRouter {
    pub fn new(socket_path: impl Into<PathBuf>, ring_capacity: usize, idle_timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            ring: RingBuffer::new(ring_capacity),
            state: Mutex::new(RouterState {
                connected: false,
                dead: false,
                last_frame: Instant::now(),
                frames_received: 0,
            }),
            idle_timeout,
        }
    }

    /// Bind the listening socket and spawn the listener + watchdog tasks.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
            info!(path = %self.socket_path.display(), "removed stale socket file");
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "pcm ingress listening");

        let router = self.clone();
        let listen_cancel = cancel.clone();
        tokio::spawn(async move { router.listener_loop(listener, listen_cancel).await });

        let router = self.clone();
        tokio::spawn(async move { router.watchdog_loop(cancel).await });
        Ok(())
    }

    async fn listener_loop(self: Arc<Self>, listener: UnixListener, cancel: CancellationToken) {
        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        error!("pcm accept failed: {e}");
                        continue;
                    }
                },
            };

            {
                let mut state = self.state.lock().unwrap();
                if state.connected {
                    warn!("producer already connected, refusing second connection");
                    drop(stream);
                    continue;
                }
                state.connected = true;
                state.dead = false;
                state.last_frame = Instant::now();
            }
            info!("producer connected");

            let router = self.clone();
            let reader_cancel = cancel.clone();
            tokio::spawn(async move { router.reader_loop(stream, reader_cancel).await });
        }
        debug!("pcm listener stopped");
    }

    async fn reader_loop(self: Arc<Self>, mut stream: UnixStream, cancel: CancellationToken) {
        let mut reassembler = Reassembler::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut chunk)) => read,
            };
            match read {
                Err(_) => continue, // poll timeout, not an error
                Ok(Ok(0)) => {
                    info!("producer disconnected (EOF)");
                    break;
                }
                Ok(Ok(n)) => {
                    let frames = reassembler.feed(&chunk[..n]);
                    if frames.is_empty() {
                        continue;
                    }
                    let count = frames.len() as u64;
                    for frame in frames {
                        self.ring.push(frame);
                    }
                    let mut state = self.state.lock().unwrap();
                    state.last_frame = Instant::now();
                    state.frames_received += count;
                    if state.dead {
                        info!("pcm flowing again, router live");
                        state.dead = false;
                    }
                }
                Ok(Err(e)) => match e.kind() {
                    std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::NotConnected => {
                        info!("producer disconnected: {e}");
                        break;
                    }
                    _ => {
                        // Transient; the socket stays open.
                        debug!("transient pcm read error: {e}");
                    }
                },
            }
        }

        reassembler.clear();
        self.ring.clear();
        let mut state = self.state.lock().unwrap();
        state.connected = false;
        debug!("pcm reader stopped");
    }

    async fn watchdog_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(WATCHDOG_TICK) => {}
            }
            let mut state = self.state.lock().unwrap();
            if !state.connected || state.dead {
                continue;
            }
            let idle = state.last_frame.elapsed();
            if idle > self.idle_timeout {
                // Dead for fallback purposes only. The producer socket stays
                // open so the writer never sees EPIPE.
                warn!(
                    idle_secs = idle.as_secs(),
                    "no PCM within idle timeout, marking router dead"
                );
                state.dead = true;
                drop(state);
                self.ring.clear();
            }
        }
        debug!("pcm watchdog stopped");
    }

    /// Oldest queued frame, or None after a short poll wait. A dead or
    /// producer-less router returns None immediately so the pump falls back.
    pub async fn next_frame(&self, timeout: Duration) -> Option<Vec<u8>> {
        {
            let state = self.state.lock().unwrap();
            if state.dead || !state.connected {
                return None;
            }
        }
        if let Some(frame) = self.ring.pop() {
            return Some(frame);
        }
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(1)).await;
            if let Some(frame) = self.ring.pop() {
                return Some(frame);
            }
        }
        None
    }

    /// True while a frame arrived within the grace window.
    pub fn pcm_available(&self, grace: Duration) -> bool {
        let state = self.state.lock().unwrap();
        state.connected && !state.dead && state.last_frame.elapsed() < grace
    }

    pub fn is_dead(&self) -> bool {
        self.state.lock().unwrap().dead
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    pub fn frames_dropped(&self) -> u64 {
        self.ring.dropped()
    }

    pub fn stats(&self) -> BufferStatus {
        BufferStatus {
            fill: self.ring.len(),
            capacity: self.ring.capacity(),
        }
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }
}

impl Drop for PcmInputRouter {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}
