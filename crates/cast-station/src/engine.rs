//! Playout engine: the metronome of the station.
//!
//! A single task dequeues events, opens the decoder, and streams paced
//! frames to the PCM sink. Lifecycle events bracket every segment:
//! `segment_started` fires before the first audible byte (THINK),
//! `segment_finished` after the last (DO). For one segment the order is
//! always enqueue → started → frames in sample order → EOF → finished, and
//! THINK for a segment completes before its DO begins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cast_proto::frame::{frame_period, FRAME_BYTES};
use cast_proto::pacer::{PaceZone, Pacer};

use crate::decoder::DecoderFactory;
use crate::event::AudioEvent;
use crate::queue::PlayoutQueue;
use crate::sink::{PcmSink, TowerControl};

/// Typed segment-lifecycle contract. The engine publishes; the DJ,
/// observability, and heartbeat listeners subscribe.
pub trait SegmentListener: Send + Sync {
    fn on_segment_started(&self, segment: &AudioEvent) -> anyhow::Result<()>;
    fn on_segment_finished(&self, segment: &AudioEvent) -> anyhow::Result<()>;
}

/// Startup walks the phases in order; `Draining` and `Stopped` are terminal
/// for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Bootstrap,
    StartupAnnouncementPlaying,
    StartupThinkComplete,
    StartupDoEnqueue,
    NormalOperation,
    Draining,
    Stopped,
}

impl LifecyclePhase {
    fn pre_normal(&self) -> bool {
        matches!(
            self,
            LifecyclePhase::Bootstrap
                | LifecyclePhase::StartupAnnouncementPlaying
                | LifecyclePhase::StartupThinkComplete
                | LifecyclePhase::StartupDoEnqueue
        )
    }
}

/// External control surface for the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    draining: Arc<AtomicBool>,
    stopped: watch::Receiver<bool>,
}

impl EngineHandle {
    /// Begin orderly shutdown. The in-flight segment plays to completion and
    /// the next DO is the terminal DO.
    pub fn drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Wait for the playout loop to stop. Returns false on timeout.
    pub async fn wait_for_stopped(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.clone();
        let result = tokio::time::timeout(timeout, stopped.wait_for(|&done| done)).await;
        result.is_ok()
    }
}

pub struct PlayoutEngine {
    queue: Arc<PlayoutQueue>,
    listeners: Vec<Arc<dyn SegmentListener>>,
    decoders: Arc<dyn DecoderFactory>,
    sink: Box<dyn PcmSink>,
    telemetry: Option<TowerControl>,
    strict: bool,
    phase: LifecyclePhase,
    draining: Arc<AtomicBool>,
    stopped_tx: watch::Sender<bool>,
    stopped_rx: watch::Receiver<bool>,
}

const IDLE_POLL: Duration = Duration::from_millis(100);

impl PlayoutEngine {
    pub fn new(
        queue: Arc<PlayoutQueue>,
        decoders: Arc<dyn DecoderFactory>,
        sink: Box<dyn PcmSink>,
        telemetry: Option<TowerControl>,
        strict: bool,
    ) -> Self {
        let (stopped_tx, stopped_rx) = watch::channel(false);
        Self {
            queue,
            listeners: Vec::new(),
            decoders,
            sink,
            telemetry,
            strict,
            phase: LifecyclePhase::Bootstrap,
            draining: Arc::new(AtomicBool::new(false)),
            stopped_tx,
            stopped_rx,
        }
    }

    pub fn add_listener(&mut self, listener: Arc<dyn SegmentListener>) {
        self.listeners.push(listener);
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            draining: self.draining.clone(),
            stopped: self.stopped_rx.clone(),
        }
    }

    /// Run the playout loop until draining completes or the stop signal
    /// fires. `startup_announcement` is injected directly as the first active
    /// segment; it is never enqueued.
    pub async fn run(
        mut self,
        startup_announcement: Option<AudioEvent>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        info!("playout engine started");

        if let Some(announcement) = startup_announcement {
            self.assert_prenormal_queue_empty("bootstrap")?;
            self.phase = LifecyclePhase::StartupAnnouncementPlaying;
            self.play_segment(&announcement, &cancel).await?;
        } else if !self.queue.is_empty() {
            // First break was pre-enqueued against an empty queue.
            self.phase = LifecyclePhase::StartupDoEnqueue;
        }

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if self.draining.load(Ordering::SeqCst) && self.phase != LifecyclePhase::Draining {
                info!("entering draining");
                self.phase = LifecyclePhase::Draining;
            }

            match self.queue.dequeue() {
                Some(event) => {
                    self.play_segment(&event, &cancel).await?;
                    if self.phase == LifecyclePhase::Draining && self.queue.is_empty() {
                        info!("terminal playout complete");
                        break;
                    }
                }
                None => {
                    if self.phase == LifecyclePhase::Draining {
                        break;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                    }
                }
            }
        }

        self.phase = LifecyclePhase::Stopped;
        let _ = self.stopped_tx.send(true);
        info!("playout engine stopped");
        Ok(())
    }

    async fn play_segment(
        &mut self,
        segment: &AudioEvent,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        if segment.is_song() && self.phase.pre_normal() {
            info!("entering normal operation");
            self.phase = LifecyclePhase::NormalOperation;
        }

        info!(
            kind = segment.kind.as_str(),
            path = %segment.path.display(),
            "segment started"
        );
        for listener in &self.listeners {
            if let Err(e) = listener.on_segment_started(segment) {
                error!("segment_started listener failed: {e}");
                if self.strict {
                    return Err(e);
                }
            }
        }
        if self.phase == LifecyclePhase::StartupAnnouncementPlaying {
            self.phase = LifecyclePhase::StartupThinkComplete;
        }

        let mut frames = 0u64;
        match self.decoders.open(&segment.path).await {
            Ok(mut source) => {
                let mut pacer = Pacer::new(frame_period());
                pacer.resync();
                while !cancel.is_cancelled() {
                    let Some(mut frame) = source.read_frame().await else {
                        break;
                    };
                    debug_assert_eq!(frame.len(), FRAME_BYTES);
                    if (segment.gain - 1.0).abs() > f32::EPSILON {
                        apply_gain(&mut frame, segment.gain);
                    }
                    self.sink.write_frame(&frame).await;
                    frames += 1;

                    let zone = match &self.telemetry {
                        Some(control) => PaceZone::classify(control.buffer_fill().await),
                        None => PaceZone::Nominal,
                    };
                    pacer.pace(zone).await;
                }
            }
            Err(e) => {
                // The segment is skipped but its lifecycle still closes, so
                // the DO fires and the programme continues.
                warn!(path = %segment.path.display(), "decoder open failed: {e}");
            }
        }

        if cancel.is_cancelled() {
            debug!("segment aborted by stop signal");
            return Ok(());
        }

        debug!(frames, "segment decoded to EOF");
        if self.phase == LifecyclePhase::StartupThinkComplete {
            self.assert_prenormal_queue_empty("startup announcement finish")?;
            self.phase = LifecyclePhase::StartupDoEnqueue;
        }
        for listener in &self.listeners {
            if let Err(e) = listener.on_segment_finished(segment) {
                error!("segment_finished listener failed: {e}");
                if self.strict {
                    return Err(e);
                }
            }
        }
        info!(
            kind = segment.kind.as_str(),
            path = %segment.path.display(),
            "segment finished"
        );
        Ok(())
    }

    /// Pre-fill and external enqueue are forbidden before normal operation.
    fn assert_prenormal_queue_empty(&self, at: &str) -> anyhow::Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let msg = format!(
            "queue must be empty at {at}, found {} events",
            self.queue.len()
        );
        if self.strict {
            anyhow::bail!(msg);
        }
        error!("contract violation: {msg}");
        Ok(())
    }
}

/// Scale s16le samples in place, saturating.
pub fn apply_gain(frame: &mut [u8], gain: f32) {
    for sample in frame.chunks_exact_mut(2) {
        let value = i16::from_le_bytes([sample[0], sample[1]]);
        let scaled = (f32::from(value) * gain)
            .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
        sample.copy_from_slice(&scaled.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_scales_and_saturates() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&1000i16.to_le_bytes());
        frame.extend_from_slice(&(-1000i16).to_le_bytes());
        frame.extend_from_slice(&i16::MAX.to_le_bytes());
        apply_gain(&mut frame, 2.0);

        let a = i16::from_le_bytes([frame[0], frame[1]]);
        let b = i16::from_le_bytes([frame[2], frame[3]]);
        let c = i16::from_le_bytes([frame[4], frame[5]]);
        assert_eq!(a, 2000);
        assert_eq!(b, -2000);
        assert_eq!(c, i16::MAX);
    }

    #[test]
    fn unity_gain_is_identity() {
        let mut frame = vec![0x34, 0x12, 0xCD, 0xAB];
        let original = frame.clone();
        apply_gain(&mut frame, 1.0);
        assert_eq!(frame, original);
    }
}
