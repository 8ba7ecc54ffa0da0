//! Audio pump: one PCM frame per period, from whichever source is
//! authoritative right now, fired at the encoder without ever waiting on it.
//!
//! Arbitration per tick: a live router frame if one arrives within a very
//! short poll; digital silence while the producer went quiet less than the
//! grace window ago (so brief gaps never blip into tone); otherwise the
//! active fallback source.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use cast_proto::frame::{frame_period, silence_frame};
use cast_proto::pacer::Pacer;

use crate::encoder::EncoderManager;
use crate::router::PcmInputRouter;
use crate::source::SourceManager;

const ROUTER_POLL: Duration = Duration::from_millis(5);

pub async fn run_audio_pump(
    router: Arc<PcmInputRouter>,
    sources: Arc<SourceManager>,
    encoder: Arc<EncoderManager>,
    pcm_grace: Duration,
    cancel: CancellationToken,
) {
    info!("audio pump started");
    let mut pacer = Pacer::new(frame_period());
    pacer.resync();
    let mut live = false;

    while !cancel.is_cancelled() {
        let frame = match router.next_frame(ROUTER_POLL).await {
            Some(frame) => {
                if !live {
                    info!("live PCM authoritative");
                    live = true;
                }
                frame
            }
            None => {
                if live {
                    debug!("live PCM paused");
                    live = false;
                }
                if router.pcm_available(pcm_grace) {
                    // Short under-run: silence, not tone.
                    silence_frame()
                } else {
                    sources.next_frame()
                }
            }
        };

        encoder.write_pcm(&frame);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = pacer.wait() => {}
        }
    }
    info!("audio pump stopped");
}
