//! Shared fixtures: an in-memory decoder, a frame-collecting sink, and a
//! listener that records the segment-lifecycle event sequence.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cast_proto::frame::FRAME_BYTES;
use cast_station::decoder::{DecoderFactory, FrameSource};
use cast_station::engine::SegmentListener;
use cast_station::event::AudioEvent;
use cast_station::rotation::Rotation;
use cast_station::sink::PcmSink;

/// Decoder that yields a fixed number of frames per segment and records
/// every path it was opened with.
pub struct TestDecoderFactory {
    pub frames_per_segment: usize,
    pub opened: Arc<Mutex<Vec<PathBuf>>>,
}

impl TestDecoderFactory {
    pub fn new(frames_per_segment: usize) -> Self {
        Self {
            frames_per_segment,
            opened: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

pub struct TestSource {
    remaining: usize,
}

#[async_trait]
impl FrameSource for TestSource {
    async fn read_frame(&mut self) -> Option<Vec<u8>> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(vec![1u8; FRAME_BYTES])
    }
}

#[async_trait]
impl DecoderFactory for TestDecoderFactory {
    async fn open(&self, path: &Path) -> anyhow::Result<Box<dyn FrameSource>> {
        self.opened.lock().unwrap().push(path.to_path_buf());
        Ok(Box::new(TestSource {
            remaining: self.frames_per_segment,
        }))
    }
}

/// Sink that counts delivered frames.
#[derive(Default)]
pub struct CollectorSink {
    pub frames: Arc<Mutex<usize>>,
}

impl CollectorSink {
    pub fn new() -> (Self, Arc<Mutex<usize>>) {
        let frames = Arc::new(Mutex::new(0));
        (
            Self {
                frames: frames.clone(),
            },
            frames,
        )
    }
}

#[async_trait]
impl PcmSink for CollectorSink {
    async fn write_frame(&mut self, _frame: &[u8]) {
        *self.frames.lock().unwrap() += 1;
    }
}

/// Records `(phase, kind, path, intent_id)` tuples as events fire.
#[derive(Default)]
pub struct EventLog {
    pub entries: Arc<Mutex<Vec<(String, AudioEvent)>>>,
}

impl EventLog {
    pub fn new() -> (Arc<Self>, Arc<Mutex<Vec<(String, AudioEvent)>>>) {
        let log = Arc::new(Self::default());
        let entries = log.entries.clone();
        (log, entries)
    }
}

impl SegmentListener for EventLog {
    fn on_segment_started(&self, segment: &AudioEvent) -> anyhow::Result<()> {
        self.entries
            .lock()
            .unwrap()
            .push(("started".into(), segment.clone()));
        Ok(())
    }

    fn on_segment_finished(&self, segment: &AudioEvent) -> anyhow::Result<()> {
        self.entries
            .lock()
            .unwrap()
            .push(("finished".into(), segment.clone()));
        Ok(())
    }
}

/// Rotation cycling through a fixed playlist.
pub struct PlaylistRotation {
    playlist: Vec<PathBuf>,
    cursor: usize,
}

impl PlaylistRotation {
    pub fn new(playlist: Vec<PathBuf>) -> Self {
        Self {
            playlist,
            cursor: 0,
        }
    }
}

impl Rotation for PlaylistRotation {
    fn select_next(&mut self, _exclude: Option<&Path>) -> Option<PathBuf> {
        if self.playlist.is_empty() {
            return None;
        }
        let pick = self.playlist[self.cursor % self.playlist.len()].clone();
        self.cursor += 1;
        Some(pick)
    }

    fn record_played(&mut self, _path: &Path) {}
}

pub fn seed(dir: &Path, rel: &str) -> PathBuf {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"x").unwrap();
    path
}
