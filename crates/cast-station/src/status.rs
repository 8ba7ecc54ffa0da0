//! Observability listener: authoritative now-playing snapshot.
//!
//! A second subscriber to the segment-lifecycle contract, independent of the
//! DJ. It never influences decisions and never touches the queue.

use std::sync::Mutex;
use std::time::Instant;
use tracing::info;

use crate::engine::SegmentListener;
use crate::event::{AudioEvent, AudioEventKind};

#[derive(Debug, Clone)]
pub struct NowPlaying {
    pub kind: AudioEventKind,
    pub path: std::path::PathBuf,
    pub title: Option<String>,
    pub started_at: Instant,
}

#[derive(Default)]
pub struct StatusListener {
    current: Mutex<Option<NowPlaying>>,
}

impl StatusListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_playing(&self) -> Option<NowPlaying> {
        self.current.lock().unwrap().clone()
    }
}

impl SegmentListener for StatusListener {
    fn on_segment_started(&self, segment: &AudioEvent) -> anyhow::Result<()> {
        let title = segment
            .metadata
            .as_ref()
            .and_then(|m| m.title.clone())
            .unwrap_or_else(|| segment.path.display().to_string());
        info!(kind = segment.kind.as_str(), %title, "now playing");
        *self.current.lock().unwrap() = Some(NowPlaying {
            kind: segment.kind,
            path: segment.path.clone(),
            title: Some(title),
            started_at: Instant::now(),
        });
        Ok(())
    }

    fn on_segment_finished(&self, segment: &AudioEvent) -> anyhow::Result<()> {
        let mut current = self.current.lock().unwrap();
        if let Some(playing) = current.as_ref() {
            if playing.path == segment.path {
                *current = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_current_segment() {
        let status = StatusListener::new();
        let event = AudioEvent::new("/music/a.mp3", AudioEventKind::Song);
        status.on_segment_started(&event).unwrap();
        let playing = status.now_playing().unwrap();
        assert_eq!(playing.kind, AudioEventKind::Song);

        status.on_segment_finished(&event).unwrap();
        assert!(status.now_playing().is_none());
    }
}
