//! Encoder ownership: process, drain, stall detection, restart-with-backoff,
//! and the MP3 jitter buffer.
//!
//! The moving parts are separate tasks wired by messages rather than shared
//! flags: the stdin writer drains a small channel the pump fires into, the
//! drain task reads stdout into the MP3 ring and reports stalls, and the
//! supervisor consumes failure events, owns the child, and drives the
//! backoff schedule. The encoder state itself is a small enum behind a lock.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cast_proto::config::TowerConfig;
use cast_proto::frame::{CHANNELS, SAMPLE_RATE};

use crate::ring::RingBuffer;
use crate::silent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Stopped,
    Running,
    Restarting,
    Failed,
}

impl EncoderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderState::Stopped => "stopped",
            EncoderState::Running => "running",
            EncoderState::Restarting => "restarting",
            EncoderState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    StdoutEof,
    Stall,
    PipeError,
    ProcessExit,
}

/// How many PCM frames may wait for the stdin writer before the pump starts
/// dropping. Small: the pump must never build a backlog that skews its clock.
const STDIN_CHANNEL_FRAMES: usize = 4;
const DRAIN_CHUNK: usize = 1024;
const DRAIN_READ_TIMEOUT: Duration = Duration::from_millis(50);
const MONITOR_TICK: Duration = Duration::from_millis(100);
const WARMUP: Duration = Duration::from_millis(10);
const STOP_GRACE: Duration = Duration::from_secs(2);

struct JitterState {
    streaming: bool,
    last_read: Option<Instant>,
}

pub struct EncoderManager {
    config: TowerConfig,
    ring: Arc<RingBuffer<Vec<u8>>>,
    silent_chunk: Vec<u8>,
    state: Mutex<EncoderState>,
    stdin_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    last_data: Arc<Mutex<Instant>>,
    jitter: tokio::sync::Mutex<JitterState>,
}

impl EncoderManager {
    pub fn new(config: TowerConfig, ring: Arc<RingBuffer<Vec<u8>>>, silent_chunk: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            config,
            ring,
            silent_chunk,
            state: Mutex::new(EncoderState::Stopped),
            stdin_tx: Mutex::new(None),
            last_data: Arc::new(Mutex::new(Instant::now())),
            jitter: tokio::sync::Mutex::new(JitterState {
                streaming: false,
                last_read: None,
            }),
        })
    }

    pub fn state(&self) -> EncoderState {
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EncoderState::Running
    }

    fn set_state(&self, state: EncoderState) {
        let mut current = self.state.lock().unwrap();
        if *current != state {
            info!(from = current.as_str(), to = state.as_str(), "encoder state");
            *current = state;
        }
    }

    // ── Pump-facing: fire-and-forget PCM ──────────────────────────────────────

    /// Write one PCM frame toward encoder stdin. Either it is accepted
    /// immediately or it is dropped; the pump's clock is never held up.
    pub fn write_pcm(&self, frame: &[u8]) {
        let tx = self.stdin_tx.lock().unwrap().clone();
        let Some(tx) = tx else {
            return; // no encoder; frame dropped
        };
        match tx.try_send(frame.to_vec()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("encoder stdin backlog full, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Encoder going down; the supervisor already knows.
            }
        }
    }

    // ── Fan-out-facing: jitter-buffered MP3 ───────────────────────────────────

    /// Always returns data; never blocks longer than roughly one chunk
    /// period. While the encoder is not RUNNING the silent chunk is served so
    /// clients ride out outages without a disconnect.
    pub async fn get_chunk(&self, size: usize) -> Vec<u8> {
        if self.state() != EncoderState::Running {
            return self.silent(size);
        }

        let mut jitter = self.jitter.lock().await;
        let min_chunks = self.config.encoder_jitter_min_chunks;

        if !jitter.streaming {
            // Filling: wait briefly for the waterline, then fall back to
            // silence rather than blocking the broadcast.
            if self.ring.len() < min_chunks {
                for _ in 0..10 {
                    tokio::time::sleep(Duration::from_millis(3)).await;
                    if self.ring.len() >= min_chunks {
                        break;
                    }
                }
                if self.ring.len() < min_chunks {
                    return self.silent(size);
                }
            }
            jitter.streaming = true;
            jitter.last_read = None;
            info!(buffered = self.ring.len(), "jitter buffer primed, streaming");
        }

        // Streaming: enforce the fixed read cadence.
        let interval = Duration::from_millis(self.config.encoder_jitter_read_interval_ms);
        if let Some(last) = jitter.last_read {
            let elapsed = last.elapsed();
            if elapsed < interval {
                tokio::time::sleep(interval - elapsed).await;
            }
        }

        // Underflow: pause to silence until the buffer refills.
        if self.ring.len() < self.config.encoder_jitter_recover_chunks {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if self.ring.len() < self.config.encoder_jitter_recover_chunks {
                debug!(buffered = self.ring.len(), "jitter underflow, serving silence");
                jitter.last_read = Some(Instant::now());
                return self.silent(size);
            }
        }

        let want = self.config.encoder_target_chunk_rate.min(size.max(1));
        jitter.last_read = Some(Instant::now());
        match self.ring.read_bytes(want) {
            Some(chunk) if !chunk.is_empty() => chunk,
            _ => self.silent(size),
        }
    }

    fn silent(&self, size: usize) -> Vec<u8> {
        if self.silent_chunk.is_empty() {
            return silent::minimal_chunk(size);
        }
        let take = size.min(self.silent_chunk.len()).max(1);
        self.silent_chunk[..take].to_vec()
    }

    // ── Supervisor ────────────────────────────────────────────────────────────

    /// Own the encoder for the life of the service: start, watch, restart
    /// with backoff, give up after `encoder_max_restarts` consecutive failed
    /// starts.
    pub fn run_supervisor(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut failed_starts: u32 = 0;
            let mut backoff_idx: usize = 0;

            loop {
                if cancel.is_cancelled() {
                    break;
                }
                match self.spawn_encoder() {
                    Ok((child, stdout)) => {
                        failed_starts = 0;
                        // Fresh encoder, fresh buffer: stale audio is worse
                        // than a short gap.
                        self.ring.clear();
                        {
                            let mut jitter = self.jitter.lock().await;
                            jitter.streaming = false;
                            jitter.last_read = None;
                        }
                        tokio::time::sleep(WARMUP).await;
                        *self.last_data.lock().unwrap() = Instant::now();
                        self.set_state(EncoderState::Running);

                        let failure = self.babysit(child, stdout, &cancel).await;
                        if cancel.is_cancelled() {
                            break;
                        }
                        warn!(?failure, "encoder failed");
                        self.set_state(EncoderState::Restarting);
                        backoff_idx = 0;
                    }
                    Err(e) => {
                        failed_starts += 1;
                        error!(attempt = failed_starts, "encoder start failed: {e}");
                        if failed_starts >= self.config.encoder_max_restarts {
                            error!(
                                restarts = failed_starts,
                                "encoder start failed repeatedly, giving up"
                            );
                            self.set_state(EncoderState::Failed);
                            return;
                        }
                        self.set_state(EncoderState::Restarting);
                    }
                }

                let delay = self.backoff_delay(backoff_idx);
                backoff_idx += 1;
                info!(delay_ms = delay.as_millis() as u64, "encoder restart backoff");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            self.set_state(EncoderState::Stopped);
            *self.stdin_tx.lock().unwrap() = None;
            debug!("encoder supervisor stopped");
        })
    }

    fn backoff_delay(&self, idx: usize) -> Duration {
        let schedule = &self.config.encoder_backoff_ms;
        let ms = schedule[idx.min(schedule.len() - 1)];
        Duration::from_millis(ms)
    }

    fn spawn_encoder(&self) -> anyhow::Result<(Child, ChildStdout)> {
        let mut child = Command::new("ffmpeg")
            .arg("-hide_banner")
            .arg("-f")
            .arg("s16le")
            .arg("-ar")
            .arg(SAMPLE_RATE.to_string())
            .arg("-ac")
            .arg(CHANNELS.to_string())
            .arg("-i")
            .arg("pipe:0")
            .arg("-f")
            .arg("mp3")
            .arg("-b:a")
            .arg(&self.config.bitrate)
            .arg("-acodec")
            .arg("libmp3lame")
            .arg("pipe:1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn ffmpeg encoder: {e}"))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("encoder stdin missing"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("encoder stdout missing"))?;

        // The pump's writes go through this channel; the writer task is the
        // only place that actually touches stdin.
        let (tx, rx) = mpsc::channel::<Vec<u8>>(STDIN_CHANNEL_FRAMES);
        *self.stdin_tx.lock().unwrap() = Some(tx);
        tokio::spawn(stdin_writer(stdin, rx));

        info!("ffmpeg encoder started");
        Ok((child, stdout))
    }

    /// Wait for the running encoder to fail, combining the drain task's
    /// reports with process-exit and coarse-stall monitoring. On a stop
    /// signal the child is closed via stdin EOF, then given a grace period,
    /// then killed.
    async fn babysit(
        &self,
        mut child: Child,
        stdout: ChildStdout,
        cancel: &CancellationToken,
    ) -> Failure {
        let (failure_tx, mut failure_rx) = mpsc::channel::<Failure>(4);
        let drain_cancel = CancellationToken::new();
        let drain = tokio::spawn(drain_loop(
            stdout,
            self.ring.clone(),
            self.last_data.clone(),
            Duration::from_millis(self.config.encoder_stall_threshold_ms),
            failure_tx.clone(),
            drain_cancel.clone(),
        ));

        enum Exit {
            Stopping,
            Failed(Failure),
        }

        let coarse_stall = Duration::from_millis(self.config.encoder_stall_ms);
        let exit = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Exit::Stopping,
                reported = failure_rx.recv() => {
                    break Exit::Failed(reported.unwrap_or(Failure::StdoutEof));
                }
                status = child.wait() => {
                    debug!(?status, "encoder process exited");
                    break Exit::Failed(Failure::ProcessExit);
                }
                _ = tokio::time::sleep(MONITOR_TICK) => {
                    let elapsed = self.last_data.lock().unwrap().elapsed();
                    if elapsed > coarse_stall {
                        warn!(
                            stalled_ms = elapsed.as_millis() as u64,
                            "no encoder output within coarse stall bound"
                        );
                        break Exit::Failed(Failure::Stall);
                    }
                }
            }
        };

        // Dropping the sender closes stdin (EOF) once the writer drains.
        *self.stdin_tx.lock().unwrap() = None;
        drain_cancel.cancel();
        let failure = match exit {
            Exit::Stopping => {
                match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                    Ok(_) => debug!("encoder exited after stdin EOF"),
                    Err(_) => {
                        warn!("encoder did not exit, killing");
                        let _ = child.kill().await;
                    }
                }
                Failure::ProcessExit
            }
            Exit::Failed(failure) => {
                let _ = child.kill().await;
                failure
            }
        };
        let _ = drain.await;
        failure
    }

}

async fn stdin_writer(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = stdin.write_all(&frame).await {
            debug!("encoder stdin write failed: {e}");
            break;
        }
    }
    // Dropping stdin sends EOF.
    debug!("encoder stdin writer stopped");
}

/// Read encoder stdout in small chunks into the MP3 ring, refresh the
/// freshness timestamp, and report EOF or a stall. Never touches the fan-out
/// and never reads after EOF.
async fn drain_loop(
    mut stdout: ChildStdout,
    ring: Arc<RingBuffer<Vec<u8>>>,
    last_data: Arc<Mutex<Instant>>,
    stall_threshold: Duration,
    failure_tx: mpsc::Sender<Failure>,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let startup_grace = stall_threshold * 3;
    let mut chunk = vec![0u8; DRAIN_CHUNK];

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = tokio::time::timeout(DRAIN_READ_TIMEOUT, stdout.read(&mut chunk)) => read,
        };
        match read {
            Ok(Ok(0)) => {
                warn!("encoder stdout EOF");
                let _ = failure_tx.send(Failure::StdoutEof).await;
                break;
            }
            Ok(Ok(n)) => {
                ring.push(chunk[..n].to_vec());
                *last_data.lock().unwrap() = Instant::now();
            }
            Ok(Err(e)) => {
                warn!("encoder stdout read error: {e}");
                let _ = failure_tx.send(Failure::PipeError).await;
                break;
            }
            Err(_) => {
                // Readiness timeout; check for a stall, but give a fresh
                // encoder a grace period of 3× the threshold.
                if started.elapsed() < startup_grace {
                    continue;
                }
                let stalled = last_data.lock().unwrap().elapsed();
                if stalled >= stall_threshold {
                    warn!(
                        stalled_ms = stalled.as_millis() as u64,
                        "encoder stall detected by drain"
                    );
                    let _ = failure_tx.send(Failure::Stall).await;
                    break;
                }
            }
        }
    }
    debug!("encoder drain stopped");
}
