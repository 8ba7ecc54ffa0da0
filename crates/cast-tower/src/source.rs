//! Fallback PCM sources: tone, silence, and a looping WAV file.
//!
//! When no live producer is feeding the router, the pump pulls frames from
//! whichever source is active. Every source produces a well-formed 4096-byte
//! frame synchronously and cheaply.

use std::f64::consts::TAU;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

use cast_proto::frame::{silence_frame, CHANNELS, FRAME_BYTES, FRAME_SAMPLES, SAMPLE_RATE};
use cast_proto::wire::SourceMode;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("file_path is required for 'file' mode")]
    FilePathRequired,
    #[error("file_path should not be provided for mode '{0}'")]
    FilePathUnexpected(&'static str),
    #[error("WAV file not found: {0}")]
    FileNotFound(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("not canonical WAV (s16le/48kHz/stereo): {0}")]
    BadFormat(String),
}

pub trait FallbackSource: Send {
    fn next_frame(&mut self) -> Vec<u8>;
}

// ── Tone ──────────────────────────────────────────────────────────────────────

/// Continuous sine tone with a phase accumulator so frame boundaries are
/// seamless. 0.8 amplitude keeps clear of clipping.
pub struct ToneSource {
    phase: f64,
    increment: f64,
}

impl ToneSource {
    pub fn new(frequency: f32) -> Self {
        Self {
            phase: 0.0,
            increment: TAU * f64::from(frequency) / f64::from(SAMPLE_RATE),
        }
    }
}

impl FallbackSource for ToneSource {
    fn next_frame(&mut self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_BYTES);
        for _ in 0..FRAME_SAMPLES {
            let sample = (self.phase.sin() * 0.8 * f64::from(i16::MAX)) as i16;
            let bytes = sample.to_le_bytes();
            for _ in 0..CHANNELS {
                frame.extend_from_slice(&bytes);
            }
            self.phase = (self.phase + self.increment) % TAU;
        }
        frame
    }
}

// ── Silence ───────────────────────────────────────────────────────────────────

pub struct SilenceSource;

impl FallbackSource for SilenceSource {
    fn next_frame(&mut self) -> Vec<u8> {
        silence_frame()
    }
}

// ── File ──────────────────────────────────────────────────────────────────────

/// In-memory looping playback of a canonical-format WAV file.
pub struct FileSource {
    pcm: Vec<u8>,
    offset: usize,
}

impl FileSource {
    pub fn load(path: &Path) -> Result<Self, SourceError> {
        if !path.is_file() {
            return Err(SourceError::FileNotFound(path.to_path_buf()));
        }
        let bytes = std::fs::read(path).map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let pcm = parse_canonical_wav(&bytes)?;
        Ok(Self { pcm, offset: 0 })
    }
}

impl FallbackSource for FileSource {
    fn next_frame(&mut self) -> Vec<u8> {
        if self.pcm.is_empty() {
            return silence_frame();
        }
        let mut frame = Vec::with_capacity(FRAME_BYTES);
        while frame.len() < FRAME_BYTES {
            let need = FRAME_BYTES - frame.len();
            let available = self.pcm.len() - self.offset;
            let take = need.min(available);
            frame.extend_from_slice(&self.pcm[self.offset..self.offset + take]);
            self.offset = (self.offset + take) % self.pcm.len();
        }
        frame
    }
}

/// Extract PCM data from a WAV file, strictly requiring the canonical
/// broadcast format: PCM s16le, 48 kHz, stereo.
pub fn parse_canonical_wav(bytes: &[u8]) -> Result<Vec<u8>, SourceError> {
    let bad = |msg: &str| SourceError::BadFormat(msg.to_string());
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(bad("missing RIFF/WAVE header"));
    }

    let mut fmt_ok = false;
    let mut data: Option<Vec<u8>> = None;
    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let size = u32::from_le_bytes([bytes[pos + 4], bytes[pos + 5], bytes[pos + 6], bytes[pos + 7]])
            as usize;
        let body_start = pos + 8;
        let body_end = (body_start + size).min(bytes.len());
        match id {
            b"fmt " => {
                let fmt = &bytes[body_start..body_end];
                if fmt.len() < 16 {
                    return Err(bad("fmt chunk too short"));
                }
                let audio_format = u16::from_le_bytes([fmt[0], fmt[1]]);
                let channels = u16::from_le_bytes([fmt[2], fmt[3]]);
                let sample_rate = u32::from_le_bytes([fmt[4], fmt[5], fmt[6], fmt[7]]);
                let bits = u16::from_le_bytes([fmt[14], fmt[15]]);
                if audio_format != 1 {
                    return Err(bad("not PCM"));
                }
                if u32::from(channels) != CHANNELS {
                    return Err(bad("not stereo"));
                }
                if sample_rate != SAMPLE_RATE {
                    return Err(bad("not 48 kHz"));
                }
                if bits != 16 {
                    return Err(bad("not 16-bit"));
                }
                fmt_ok = true;
            }
            b"data" => {
                data = Some(bytes[body_start..body_end].to_vec());
            }
            _ => {}
        }
        // Chunks are word-aligned.
        pos = body_start + size + (size % 2);
    }

    if !fmt_ok {
        return Err(bad("fmt chunk missing"));
    }
    match data {
        Some(pcm) if !pcm.is_empty() => Ok(pcm),
        _ => Err(bad("data chunk missing or empty")),
    }
}

// ── Manager ───────────────────────────────────────────────────────────────────

struct ActiveSource {
    mode: SourceMode,
    file_path: Option<PathBuf>,
    source: Box<dyn FallbackSource>,
}

/// Holds the active fallback source and swaps it atomically under its lock.
pub struct SourceManager {
    tone_frequency: f32,
    active: Mutex<ActiveSource>,
}

impl SourceManager {
    pub fn new(
        tone_frequency: f32,
        default_mode: SourceMode,
        default_file_path: Option<&Path>,
    ) -> Result<Self, SourceError> {
        let active = Self::build(tone_frequency, default_mode, default_file_path)?;
        info!(mode = default_mode.as_str(), "fallback source initialised");
        Ok(Self {
            tone_frequency,
            active: Mutex::new(active),
        })
    }

    fn build(
        tone_frequency: f32,
        mode: SourceMode,
        file_path: Option<&Path>,
    ) -> Result<ActiveSource, SourceError> {
        match mode {
            SourceMode::File => {
                let path = file_path.ok_or(SourceError::FilePathRequired)?;
                let source = FileSource::load(path)?;
                Ok(ActiveSource {
                    mode,
                    file_path: Some(path.to_path_buf()),
                    source: Box::new(source),
                })
            }
            SourceMode::Tone | SourceMode::Silence => {
                if file_path.is_some() {
                    return Err(SourceError::FilePathUnexpected(mode.as_str()));
                }
                let source: Box<dyn FallbackSource> = match mode {
                    SourceMode::Tone => Box::new(ToneSource::new(tone_frequency)),
                    _ => Box::new(SilenceSource),
                };
                Ok(ActiveSource {
                    mode,
                    file_path: None,
                    source,
                })
            }
        }
    }

    /// Validate and swap the active source. A failed switch keeps the old one.
    pub fn switch(&self, mode: SourceMode, file_path: Option<&Path>) -> Result<(), SourceError> {
        let fresh = Self::build(self.tone_frequency, mode, file_path)?;
        let mut active = self.active.lock().unwrap();
        *active = fresh;
        info!(mode = mode.as_str(), "fallback source switched");
        Ok(())
    }

    pub fn next_frame(&self) -> Vec<u8> {
        self.active.lock().unwrap().source.next_frame()
    }

    pub fn current(&self) -> (SourceMode, Option<PathBuf>) {
        let active = self.active.lock().unwrap();
        (active.mode, active.file_path.clone())
    }
}
